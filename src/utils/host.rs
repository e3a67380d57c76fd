//! Local host identification.

use once_cell::sync::Lazy;

static HOSTNAME: Lazy<String> = Lazy::new(detect_hostname);

/// The identifier this process uses on the network when none is configured.
pub fn local_hostname() -> &'static str {
    &HOSTNAME
}

fn detect_hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_is_stable_and_non_empty() {
        assert!(!local_hostname().is_empty());
        assert_eq!(local_hostname(), local_hostname());
    }
}
