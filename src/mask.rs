//! Credential masking for text that ends up in logs or error messages.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Replacement token for anything that looks like a credential.
pub const MASK: &str = "****";

static URI_USERINFO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*://)[^:@/\s]+:[^@/\s]*@").unwrap()
});

static LONG_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<flag>--(?:password|passwd|user|username)(?:=|\s+))(?P<value>'[^']*'|"[^"]*"|[^\s\-]\S*)"#,
    )
    .unwrap()
});

/// A separated value that looks like a path is an argument, not a secret
/// (`mkdir -p /tmp/dumps`).
static SHORT_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<lead>^|\s)(?P<flag>-[pu])(?:'[^']*'|"[^"]*"|[^\s\-]\S*|(?P<sep>\s+)(?:'[^']*'|"[^"]*"|[^\s\-/.]\S*))"#,
    )
    .unwrap()
});

/// Shared access signature in a query string.
static SAS_SIGNATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<key>[?&]sig=)[^&\s)]+").unwrap());

static ENV_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<name>\b[A-Za-z0-9_]*(?i:password|passwd|pwd|secret|token)[A-Za-z0-9_]*)=(?P<value>'[^']*'|"[^"]*"|\S+)"#,
    )
    .unwrap()
});

/// Mask credential-shaped substrings: URI userinfo, `-p`/`-u` style flag
/// values, `--password=` style options, `PASSWORD=` style environment
/// assignments and SAS `sig=` query values. Everything else is preserved byte for byte.
pub fn mask(text: &str) -> String {
    let masked = URI_USERINFO.replace_all(text, format!("${{scheme}}{MASK}:{MASK}@"));
    let masked = LONG_FLAG.replace_all(&masked, format!("${{flag}}{MASK}"));
    let masked = SHORT_FLAG.replace_all(&masked, |caps: &Captures| {
        let sep = caps.name("sep").map_or("", |m| m.as_str());
        format!("{}{}{sep}{MASK}", &caps["lead"], &caps["flag"])
    });
    let masked = ENV_ASSIGNMENT.replace_all(&masked, format!("${{name}}={MASK}"));
    let masked = SAS_SIGNATURE.replace_all(&masked, format!("${{key}}{MASK}"));
    masked.into_owned()
}
