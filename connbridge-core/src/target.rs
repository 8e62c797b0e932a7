//! CONNECT target matching.

const DEFAULT_TLS_PORT: &str = "443";

/// Reports whether `host` names one of the configured CONNECT targets.
///
/// A target matches when it is equal to `host`, or when it has no port and
/// `host` is that target on the default TLS port.
///
/// # Examples
///
/// ```
/// use connbridge_core::target::matches_target;
///
/// let targets = vec!["alpha".to_string(), "beta:443".to_string()];
/// assert!(matches_target("alpha", &targets));
/// assert!(matches_target("alpha:443", &targets));
/// assert!(matches_target("beta:443", &targets));
/// assert!(!matches_target("beta", &targets));
/// assert!(!matches_target("alpha:8443", &targets));
/// ```
pub fn matches_target(host: &str, targets: &[String]) -> bool {
    targets.iter().any(|target| {
        if host == target {
            return true;
        }
        if target.contains(':') {
            return false;
        }
        host.strip_prefix(target.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(|port| port == DEFAULT_TLS_PORT)
    })
}
