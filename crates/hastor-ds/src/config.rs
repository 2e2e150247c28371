//! Directory services configuration.

use hastor_sys::{SecretString, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Minimum network timeout in seconds.
pub const MIN_TIMEOUT_SEC: u32 = 5;
/// Maximum network timeout in seconds.
pub const MAX_TIMEOUT_SEC: u32 = 40;
/// Default network timeout in seconds.
pub const DEFAULT_TIMEOUT_SEC: u32 = 10;

/// Directory service flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsType {
    /// Active Directory.
    Ad,
    /// FreeIPA.
    Ipa,
    /// Plain LDAP.
    Ldap,
}

impl std::fmt::Display for DsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DsType::Ad => "AD",
            DsType::Ipa => "IPA",
            DsType::Ldap => "LDAP",
        })
    }
}

/// How the appliance authenticates to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "credential_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DsCredential {
    /// Kerberos user with password.
    KerberosUser {
        /// User name, optionally qualified with `@REALM`.
        username: String,
        /// Password.
        password: SecretString,
    },
    /// Kerberos principal with keys in the system keytab.
    KerberosPrincipal {
        /// Principal name.
        principal: String,
    },
    /// LDAP simple bind.
    LdapPlain {
        /// Bind DN.
        binddn: String,
        /// Bind password.
        bindpw: SecretString,
    },
    /// LDAP anonymous bind.
    LdapAnonymous,
    /// LDAP bind with a TLS client certificate.
    LdapMtls {
        /// Client certificate path.
        client_certificate: PathBuf,
        /// Client key path.
        client_key: PathBuf,
    },
}

impl DsCredential {
    /// True for the Kerberos-based credential kinds.
    pub fn is_kerberos(&self) -> bool {
        matches!(
            self,
            DsCredential::KerberosUser { .. } | DsCredential::KerberosPrincipal { .. }
        )
    }

    /// Password carried by the credential, if any.
    pub fn secret(&self) -> Option<&str> {
        match self {
            DsCredential::KerberosUser { password, .. } => Some(password.expose()),
            DsCredential::LdapPlain { bindpw, .. } => Some(bindpw.expose()),
            _ => None,
        }
    }
}

/// Active Directory settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdConfig {
    /// DNS domain name, e.g. `ad.example.com`.
    pub domain: String,
    /// NetBIOS name of this appliance.
    pub netbiosname: String,
    /// NetBIOS name of the domain.
    pub workgroup: String,
    /// AD site.
    #[serde(default)]
    pub site: Option<String>,
    /// OU holding the computer account.
    #[serde(default)]
    pub computer_account_ou: Option<String>,
}

/// FreeIPA settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpaConfig {
    /// IPA server the appliance was joined against.
    pub target_server: String,
    /// Host name of this appliance in IPA.
    pub hostname: String,
    /// IPA domain.
    pub domain: String,
    /// Base DN.
    pub basedn: String,
    /// Verify server certificates.
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
}

/// Plain LDAP settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server URLs, tried in order.
    pub server_urls: Vec<String>,
    /// Base DN.
    pub basedn: String,
    /// Issue StartTLS on `ldap://` URLs.
    #[serde(default)]
    pub starttls: bool,
    /// Verify server certificates.
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_SEC
}

/// Type-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DsConfiguration {
    /// Active Directory.
    Ad(AdConfig),
    /// FreeIPA.
    Ipa(IpaConfig),
    /// Plain LDAP.
    Ldap(LdapConfig),
}

impl DsConfiguration {
    /// Service type this configuration belongs to.
    pub fn ds_type(&self) -> DsType {
        match self {
            DsConfiguration::Ad(_) => DsType::Ad,
            DsConfiguration::Ipa(_) => DsType::Ipa,
            DsConfiguration::Ldap(_) => DsType::Ldap,
        }
    }
}

/// The directory services singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DSConfig {
    /// Configured service, `null` when none.
    pub service_type: Option<DsType>,
    /// Whether the service is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Credential.
    #[serde(default)]
    pub credential: Option<DsCredential>,
    /// Kerberos realm; required for AD and IPA, optional for LDAP.
    #[serde(default)]
    pub kerberos_realm: Option<String>,
    /// Type-specific settings.
    #[serde(default)]
    pub configuration: Option<DsConfiguration>,
    /// Network timeout for LDAP and Kerberos calls.
    #[serde(default = "default_timeout")]
    pub timeout_sec: u32,
    /// Register the appliance in DNS.
    #[serde(default)]
    pub enable_dns_updates: bool,
    /// Keep a local cache of directory users and groups.
    #[serde(default = "default_true")]
    pub enable_account_cache: bool,
}

impl Default for DSConfig {
    fn default() -> Self {
        Self {
            service_type: None,
            enabled: false,
            credential: None,
            kerberos_realm: None,
            configuration: None,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            enable_dns_updates: false,
            enable_account_cache: true,
        }
    }
}

impl DSConfig {
    /// Active Directory settings, when configured.
    pub fn ad(&self) -> Option<&AdConfig> {
        match &self.configuration {
            Some(DsConfiguration::Ad(c)) => Some(c),
            _ => None,
        }
    }

    /// FreeIPA settings, when configured.
    pub fn ipa(&self) -> Option<&IpaConfig> {
        match &self.configuration {
            Some(DsConfiguration::Ipa(c)) => Some(c),
            _ => None,
        }
    }

    /// Plain LDAP settings, when configured.
    pub fn ldap(&self) -> Option<&LdapConfig> {
        match &self.configuration {
            Some(DsConfiguration::Ldap(c)) => Some(c),
            _ => None,
        }
    }

    /// Network timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_sec))
    }

    /// Whether the Kerberos foundation checks apply.
    pub fn uses_kerberos(&self) -> bool {
        match self.service_type {
            Some(DsType::Ad) | Some(DsType::Ipa) => true,
            Some(DsType::Ldap) => self.kerberos_realm.is_some(),
            None => false,
        }
    }

    /// Validate this configuration on its own.
    pub fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let schema = "directoryservices";

        if !(MIN_TIMEOUT_SEC..=MAX_TIMEOUT_SEC).contains(&self.timeout_sec) {
            errors.add(
                format!("{schema}.timeout_sec"),
                format!("Timeout must be between {MIN_TIMEOUT_SEC} and {MAX_TIMEOUT_SEC} seconds."),
            );
        }

        let Some(ds_type) = self.service_type else {
            if self.enabled {
                errors.add(format!("{schema}.service_type"), "A service type is required to enable directory services.");
            }
            return errors.check();
        };

        match &self.configuration {
            None if self.enabled => {
                errors.add(format!("{schema}.configuration"), "Configuration is required.");
            }
            Some(c) if c.ds_type() != ds_type => {
                errors.add(
                    format!("{schema}.configuration.type"),
                    format!("Configuration type {} does not match service type {ds_type}.", c.ds_type()),
                );
            }
            _ => {}
        }

        match (&self.credential, ds_type) {
            (None, _) if self.enabled => {
                errors.add(format!("{schema}.credential"), "A credential is required.");
            }
            (Some(cred), DsType::Ad | DsType::Ipa) if !cred.is_kerberos() => {
                errors.add(
                    format!("{schema}.credential.credential_type"),
                    format!("{ds_type} requires a kerberos credential."),
                );
            }
            (Some(cred), DsType::Ldap) if cred.is_kerberos() && self.kerberos_realm.is_none() => {
                errors.add(
                    format!("{schema}.kerberos_realm"),
                    "Kerberos credentials require a kerberos realm.",
                );
            }
            _ => {}
        }

        if matches!(ds_type, DsType::Ad | DsType::Ipa) && self.enabled && self.kerberos_realm.is_none() {
            errors.add(format!("{schema}.kerberos_realm"), format!("{ds_type} requires a kerberos realm."));
        }

        if let Some(DsConfiguration::Ldap(ldap)) = &self.configuration {
            if self.enabled && ldap.server_urls.is_empty() {
                errors.add(format!("{schema}.configuration.server_urls"), "At least one server is required.");
            }
            for (i, url) in ldap.server_urls.iter().enumerate() {
                if !(url.starts_with("ldap://") || url.starts_with("ldaps://")) {
                    errors.add(
                        format!("{schema}.configuration.server_urls.{i}"),
                        "URL must use the ldap:// or ldaps:// scheme.",
                    );
                }
            }
        }

        if let Some(DsConfiguration::Ad(ad)) = &self.configuration {
            if ad.netbiosname.is_empty() || ad.netbiosname.len() > 15 {
                errors.add(
                    format!("{schema}.configuration.netbiosname"),
                    "NetBIOS name must be 1 to 15 characters.",
                );
            }
        }

        errors.check()
    }

    /// Validate a change from `old` to `self`.
    pub fn validate_update(&self, old: &DSConfig) -> std::result::Result<(), ValidationErrors> {
        let mut errors = match self.validate() {
            Ok(()) => ValidationErrors::new(),
            Err(e) => e,
        };
        if old.enabled && self.enabled && old.service_type != self.service_type {
            errors.add(
                "directoryservices.service_type",
                "Service type may not be changed while directory services are enabled.",
            );
        }
        errors.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ad_config() -> DSConfig {
        DSConfig {
            service_type: Some(DsType::Ad),
            enabled: true,
            credential: Some(DsCredential::KerberosPrincipal {
                principal: "TRUENAS$@AD.EXAMPLE.COM".into(),
            }),
            kerberos_realm: Some("AD.EXAMPLE.COM".into()),
            configuration: Some(DsConfiguration::Ad(AdConfig {
                domain: "ad.example.com".into(),
                netbiosname: "TRUENAS".into(),
                workgroup: "AD".into(),
                site: None,
                computer_account_ou: None,
            })),
            ..DSConfig::default()
        }
    }

    #[test]
    fn test_valid_ad_config() {
        ad_config().validate().unwrap();
    }

    #[test]
    fn test_timeout_bounds() {
        let mut cfg = ad_config();
        cfg.timeout_sec = 41;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.errors()[0].attribute, "directoryservices.timeout_sec");
        cfg.timeout_sec = 5;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_ad_requires_kerberos_credential() {
        let mut cfg = ad_config();
        cfg.credential = Some(DsCredential::LdapAnonymous);
        let err = cfg.validate().unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| e.attribute == "directoryservices.credential.credential_type"));
    }

    #[test]
    fn test_configuration_must_match_type() {
        let mut cfg = ad_config();
        cfg.service_type = Some(DsType::Ldap);
        cfg.credential = Some(DsCredential::LdapAnonymous);
        let err = cfg.validate().unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| e.attribute == "directoryservices.configuration.type"));
    }

    #[test]
    fn test_type_change_while_enabled() {
        let old = ad_config();
        let mut new = old.clone();
        new.service_type = Some(DsType::Ldap);
        new.credential = Some(DsCredential::LdapAnonymous);
        new.configuration = Some(DsConfiguration::Ldap(LdapConfig {
            server_urls: vec!["ldap://ldap.example.com".into()],
            basedn: "dc=example,dc=com".into(),
            starttls: false,
            validate_certificates: true,
        }));
        let err = new.validate_update(&old).unwrap_err();
        assert!(err
            .errors()
            .iter()
            .any(|e| e.attribute == "directoryservices.service_type"));
    }

    #[test]
    fn test_disabled_null_is_valid() {
        DSConfig::default().validate().unwrap();
    }

    #[test]
    fn test_wire_format() {
        let cfg: DSConfig = serde_json::from_value(json!({
            "service_type": "LDAP",
            "enabled": true,
            "credential": {"credential_type": "LDAP_PLAIN", "binddn": "cn=admin", "bindpw": "pw123456"},
            "configuration": {"type": "LDAP", "server_urls": ["ldaps://ldap1"], "basedn": "dc=x"}
        }))
        .unwrap();
        assert_eq!(cfg.timeout_sec, DEFAULT_TIMEOUT_SEC);
        assert!(cfg.enable_account_cache);
        match &cfg.credential {
            Some(DsCredential::LdapPlain { bindpw, .. }) => assert_eq!(bindpw.expose(), "pw123456"),
            other => panic!("unexpected {other:?}"),
        }
        cfg.validate().unwrap();
    }
}
