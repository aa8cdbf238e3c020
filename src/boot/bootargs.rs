//! Boot Arguments - Command-line token parsing
//!
//! The bootloader hands the kernel a flat command line. Subsystems query
//! it for `name` and `name=value` tokens; unknown tokens are ignored by
//! their consumers.

use alloc::string::String;
use alloc::vec::Vec;

/// Parsed boot command line
#[derive(Debug, Clone, Default)]
pub struct BootArgs {
    tokens: Vec<(String, Option<String>)>,
}

impl BootArgs {
    /// Split a command line into tokens
    pub fn parse(cmdline: &str) -> Self {
        let tokens = cmdline
            .split_whitespace()
            .map(|tok| match tok.split_once('=') {
                Some((name, value)) => (String::from(name), Some(String::from(value))),
                None => (String::from(tok), None),
            })
            .collect();
        Self { tokens }
    }

    /// Is the token present (with or without a value)?
    pub fn flag(&self, name: &str) -> bool {
        self.tokens.iter().any(|(n, _)| n == name)
    }

    /// The token's raw value, if it has one
    pub fn value_str(&self, name: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// The token's value as a number (decimal, or hex with `0x`)
    pub fn value_usize(&self, name: &str) -> Option<usize> {
        parse_number(self.value_str(name)?)
    }
}

fn parse_number(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<usize>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_values() {
        let args = BootArgs::parse("enable min=64 fc_size=0x10 name=io.buffers quiet");
        assert!(args.flag("enable"));
        assert!(args.flag("quiet"));
        assert!(!args.flag("disable"));
        assert_eq!(args.value_usize("min"), Some(64));
        assert_eq!(args.value_usize("fc_size"), Some(16));
        assert_eq!(args.value_str("name"), Some("io.buffers"));
    }

    #[test]
    fn test_flag_with_value_is_still_a_flag() {
        let args = BootArgs::parse("min=64");
        assert!(args.flag("min"));
        assert_eq!(args.value_str("enable"), None);
    }

    #[test]
    fn test_malformed_numbers() {
        let args = BootArgs::parse("min=abc max=");
        assert_eq!(args.value_usize("min"), None);
        assert_eq!(args.value_usize("max"), None);
        assert!(args.flag("max"));
    }

    #[test]
    fn test_empty_cmdline() {
        let args = BootArgs::parse("");
        assert!(!args.flag("enable"));
    }
}
