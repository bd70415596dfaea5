use std::path::PathBuf;

/// Transport security used when connecting to a core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportCredentials {
    /// Plain TCP.
    #[default]
    Insecure,

    /// TLS, trusting the certificates in a PEM file.
    Tls { ca_path: PathBuf },
}

impl TransportCredentials {
    /// TLS when a certificate path is given, plain TCP otherwise.
    pub fn from_cert_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(ca_path) if !ca_path.as_os_str().is_empty() => TransportCredentials::Tls { ca_path },
            _ => TransportCredentials::Insecure,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TransportCredentials::Tls { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_insecure() {
        assert_eq!(TransportCredentials::from_cert_path(None), TransportCredentials::Insecure);
        assert_eq!(
            TransportCredentials::from_cert_path(Some(PathBuf::new())),
            TransportCredentials::Insecure
        );
    }

    #[test]
    fn path_selects_tls() {
        let creds = TransportCredentials::from_cert_path(Some("certs/ca.pem".into()));
        assert!(creds.is_tls());
    }
}
