//! LDAP searches through `ldapsearch`.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{CommandSpec, Runner};
use crate::secret::SecretString;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// `ldapsearch` exit code for invalid credentials.
const LDAP_INVALID_CREDENTIALS: i32 = 49;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LdapScope {
    /// The base entry only.
    Base,
    /// Immediate children.
    One,
    /// The whole subtree.
    Sub,
}

impl LdapScope {
    fn as_arg(&self) -> &'static str {
        match self {
            LdapScope::Base => "base",
            LdapScope::One => "one",
            LdapScope::Sub => "sub",
        }
    }
}

/// How to bind before searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdapBind {
    /// Simple bind with a DN and password.
    Simple {
        /// Bind DN.
        binddn: String,
        /// Bind password.
        password: SecretString,
    },
    /// Anonymous simple bind.
    Anonymous,
    /// SASL/GSSAPI using the current kerberos ticket.
    Gssapi {
        /// Require a sealed (encrypted) connection.
        sealed: bool,
    },
    /// SASL/EXTERNAL with a client certificate.
    Mtls {
        /// Client certificate.
        cert: PathBuf,
        /// Client key.
        key: PathBuf,
    },
}

/// Connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapOptions {
    /// Network and search time limit.
    pub timeout: Duration,
    /// Issue StartTLS and require it to succeed.
    pub starttls: bool,
    /// Verify the server certificate.
    pub validate_certificates: bool,
}

impl Default for LdapOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            starttls: false,
            validate_certificates: true,
        }
    }
}

/// One search result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapEntry {
    /// Distinguished name; empty for the root DSE.
    pub dn: String,
    /// Attribute values in listing order.
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl LdapEntry {
    /// First value of `attr`.
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attrs.get(attr)?.first().map(String::as_str)
    }
}

/// LDAP contract.
#[async_trait]
pub trait Ldap: Send + Sync {
    /// Bind and search.
    async fn search(
        &self,
        url: &str,
        bind: &LdapBind,
        base: &str,
        scope: LdapScope,
        filter: &str,
        opts: &LdapOptions,
    ) -> CallResult<Vec<LdapEntry>>;

    /// Bind and read the root DSE.
    async fn root_dse(
        &self,
        url: &str,
        bind: &LdapBind,
        opts: &LdapOptions,
    ) -> CallResult<LdapEntry> {
        let entries = self
            .search(url, bind, "", LdapScope::Base, "(objectClass=*)", opts)
            .await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| CallError::new(Errno::ENOENT, format!("{url}: empty root DSE")))
    }
}

/// Parse `ldapsearch -LLL` LDIF output.
pub fn parse_ldif(text: &str) -> CallResult<Vec<LdapEntry>> {
    // Unfold continuation lines first.
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if let Some(cont) = raw.strip_prefix(' ') {
            if let Some(last) = lines.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        lines.push(raw.to_string());
    }

    let mut entries = Vec::new();
    let mut current: Option<LdapEntry> = None;
    for line in lines {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let Some((attr, rest)) = line.split_once(':') else {
            return Err(CallError::new(
                Errno::EINVAL,
                format!("malformed LDIF line {line:?}"),
            ));
        };
        let value = if let Some(encoded) = rest.strip_prefix(':') {
            let raw = STANDARD.decode(encoded.trim()).map_err(|e| {
                CallError::new(Errno::EINVAL, format!("{attr}: invalid base64: {e}"))
            })?;
            String::from_utf8_lossy(&raw).into_owned()
        } else {
            rest.trim_start().to_string()
        };
        let entry = current.get_or_insert_with(LdapEntry::default);
        if attr.eq_ignore_ascii_case("dn") {
            entry.dn = value;
        } else {
            entry.attrs.entry(attr.to_string()).or_default().push(value);
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    Ok(entries)
}

/// [`Ldap`] backed by the OpenLDAP `ldapsearch` client.
#[derive(Clone)]
pub struct LdapSearchCli {
    runner: Arc<dyn Runner>,
}

impl LdapSearchCli {
    /// Create a wrapper that runs commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    /// Build the command for one search.
    pub fn command(
        url: &str,
        bind: &LdapBind,
        base: &str,
        scope: LdapScope,
        filter: &str,
        opts: &LdapOptions,
    ) -> CommandSpec {
        let secs = opts.timeout.as_secs().max(1).to_string();
        let mut argv: Vec<String> = vec![
            "ldapsearch".into(),
            "-LLL".into(),
            "-H".into(),
            url.into(),
            "-o".into(),
            format!("nettimeout={secs}"),
            "-l".into(),
            secs,
            "-s".into(),
            scope.as_arg().into(),
            "-b".into(),
            base.into(),
        ];
        if opts.starttls {
            argv.push("-ZZ".into());
        }
        let mut input = None;
        let mut env = Vec::new();
        match bind {
            LdapBind::Simple { binddn, password } => {
                argv.extend(["-x".into(), "-D".into(), binddn.clone()]);
                argv.extend(["-y".into(), "/dev/stdin".into()]);
                input = Some(password.expose().as_bytes().to_vec());
            }
            LdapBind::Anonymous => argv.push("-x".into()),
            LdapBind::Gssapi { sealed } => {
                argv.extend(["-Q".into(), "-Y".into(), "GSSAPI".into()]);
                if *sealed {
                    argv.extend(["-O".into(), "minssf=56".into()]);
                }
            }
            LdapBind::Mtls { cert, key } => {
                argv.extend(["-Q".into(), "-Y".into(), "EXTERNAL".into()]);
                env.push(("LDAPTLS_CERT".to_string(), cert.display().to_string()));
                env.push(("LDAPTLS_KEY".to_string(), key.display().to_string()));
            }
        }
        if !opts.validate_certificates {
            env.push(("LDAPTLS_REQCERT".to_string(), "never".to_string()));
        }
        argv.push(filter.into());

        let mut spec = CommandSpec::new(argv).with_timeout(opts.timeout + Duration::from_secs(1));
        if let Some(input) = input {
            spec = spec.with_input(input);
        }
        for (k, v) in env {
            spec = spec.with_env(k, v);
        }
        spec
    }
}

#[async_trait]
impl Ldap for LdapSearchCli {
    async fn search(
        &self,
        url: &str,
        bind: &LdapBind,
        base: &str,
        scope: LdapScope,
        filter: &str,
        opts: &LdapOptions,
    ) -> CallResult<Vec<LdapEntry>> {
        let out = self
            .runner
            .run(Self::command(url, bind, base, scope, filter, opts))
            .await?;
        if out.timed_out {
            return Err(CallError::new(
                Errno::ETIMEDOUT,
                format!("{url}: LDAP search timed out"),
            ));
        }
        if !out.success() {
            let stderr = out.stderr_str();
            let errno = if out.exit_code == LDAP_INVALID_CREDENTIALS {
                Errno::ENOTAUTHENTICATED
            } else if stderr.to_ascii_lowercase().contains("certificate verify failed") {
                Errno::ESSLCERTVERIFICATIONERROR
            } else {
                Errno::EFAULT
            };
            return Err(CallError::new(errno, format!("{url}: {stderr}")));
        }
        parse_ldif(&out.stdout_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;

    #[test]
    fn test_parse_root_dse() {
        let ldif = "dn:\nnamingContexts: dc=example,dc=com\nsupportedLDAPVersion: 3\n\
                    supportedSASLMechanisms: GSSAPI\nsupportedSASLMechanisms: EXTERNAL\n";
        let entries = parse_ldif(ldif).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, "");
        assert_eq!(entries[0].first("namingContexts"), Some("dc=example,dc=com"));
        assert_eq!(entries[0].attrs["supportedSASLMechanisms"].len(), 2);
    }

    #[test]
    fn test_parse_folded_and_base64() {
        let ldif = "dn: uid=a,dc=example,\n dc=com\ndescription:: aMOpbGxv\n\ndn: uid=b,dc=example,dc=com\n";
        let entries = parse_ldif(ldif).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dn, "uid=a,dc=example,dc=com");
        assert_eq!(entries[0].first("description"), Some("héllo"));
    }

    #[test]
    fn test_simple_bind_password_on_stdin() {
        let bind = LdapBind::Simple {
            binddn: "cn=admin,dc=example,dc=com".into(),
            password: SecretString::new("hunter2"),
        };
        let spec = LdapSearchCli::command(
            "ldaps://ldap.example.com",
            &bind,
            "",
            LdapScope::Base,
            "(objectClass=*)",
            &LdapOptions::default(),
        );
        assert!(!spec.argv.iter().any(|a| a.contains("hunter2")));
        assert_eq!(spec.input.as_deref(), Some(&b"hunter2"[..]));
        assert!(spec.argv.contains(&"/dev/stdin".to_string()));
    }

    #[test]
    fn test_no_validation_sets_reqcert() {
        let opts = LdapOptions {
            validate_certificates: false,
            starttls: true,
            ..Default::default()
        };
        let spec = LdapSearchCli::command("ldap://x", &LdapBind::Anonymous, "", LdapScope::Base, "(objectClass=*)", &opts);
        assert!(spec.argv.contains(&"-ZZ".to_string()));
        assert!(spec
            .env
            .contains(&("LDAPTLS_REQCERT".to_string(), "never".to_string())));
    }

    #[tokio::test]
    async fn test_invalid_credentials_errno() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["ldapsearch"], 49, "", "ldap_bind: Invalid credentials (49)");
        let ldap = LdapSearchCli::new(runner);
        let err = ldap
            .root_dse("ldap://x", &LdapBind::Anonymous, &LdapOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.errno, Errno::ENOTAUTHENTICATED);
    }

    #[tokio::test]
    async fn test_gssapi_root_dse() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["ldapsearch"], 0, "dn:\nvendorName: 389 Project\n", "");
        let ldap = LdapSearchCli::new(runner.clone());
        let dse = ldap
            .root_dse("ldap://ipa.example.com", &LdapBind::Gssapi { sealed: true }, &LdapOptions::default())
            .await
            .unwrap();
        assert_eq!(dse.first("vendorName"), Some("389 Project"));
        assert!(runner.calls()[0].contains(&"minssf=56".to_string()));
    }
}
