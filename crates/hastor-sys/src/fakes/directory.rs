use crate::ad::{AdService, DomainInfo};
use crate::error::{CallError, CallResult, Errno};
use crate::kerberos::{Kerberos, KinitCredential, KinitOptions, KrbCred};
use crate::ldap::{Ldap, LdapBind, LdapEntry, LdapOptions, LdapScope};
use crate::secret::SecretString;
use crate::secrets::SecretsStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

type SecretMap = HashMap<String, SecretString>;

#[derive(Debug, Default)]
struct SecretsState {
    live: Option<SecretMap>,
    backups: HashMap<String, SecretMap>,
    keytabs: HashMap<String, Vec<u8>>,
    flushes: usize,
    calls: Vec<String>,
}

/// In-memory [`SecretsStore`]. The live store starts out missing.
#[derive(Debug, Default)]
pub struct FakeSecrets {
    state: Mutex<SecretsState>,
}

impl FakeSecrets {
    /// No live store and no backups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `secret` for `domain` in the live store, creating it.
    pub fn set_live(&self, domain: &str, secret: &str) {
        self.state
            .lock()
            .live
            .get_or_insert_with(SecretMap::new)
            .insert(domain.to_ascii_uppercase(), SecretString::new(secret));
    }

    /// Create an empty live store.
    pub fn create_empty(&self) {
        self.state.lock().live.get_or_insert_with(SecretMap::new);
    }

    /// Delete the live store.
    pub fn delete_live(&self) {
        self.state.lock().live = None;
    }

    /// Put `secret` for `domain` in the database backup of `netbiosname`.
    pub fn set_backup(&self, netbiosname: &str, domain: &str, secret: &str) {
        self.state
            .lock()
            .backups
            .entry(netbiosname.to_ascii_uppercase())
            .or_default()
            .insert(domain.to_ascii_uppercase(), SecretString::new(secret));
    }

    /// Keytab stored under `name`.
    pub fn keytab(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().keytabs.get(name).cloned()
    }

    /// Number of cache flushes.
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    /// Recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl SecretsStore for FakeSecrets {
    async fn get_machine_secret(&self, domain: &str) -> CallResult<Option<SecretString>> {
        let st = self.state.lock();
        match &st.live {
            None => Err(CallError::new(Errno::ENOENT, "secrets file does not exist")),
            Some(live) => Ok(live.get(&domain.to_ascii_uppercase()).cloned()),
        }
    }

    async fn set_machine_secret(&self, domain: &str, secret: &SecretString) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push(format!("set_machine_secret {domain}"));
        st.live
            .get_or_insert_with(SecretMap::new)
            .insert(domain.to_ascii_uppercase(), secret.clone());
        Ok(())
    }

    async fn put_keytab(&self, name: &str, keytab: &[u8]) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push(format!("put_keytab {name}"));
        st.keytabs.insert(name.to_string(), keytab.to_vec());
        Ok(())
    }

    async fn backup(&self, netbiosname: &str) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push(format!("backup {netbiosname}"));
        let live = st
            .live
            .clone()
            .ok_or_else(|| CallError::new(Errno::ENOENT, "secrets file does not exist"))?;
        st.backups.insert(netbiosname.to_ascii_uppercase(), live);
        Ok(())
    }

    async fn restore(&self, netbiosname: &str) -> CallResult<bool> {
        let mut st = self.state.lock();
        st.calls.push(format!("restore {netbiosname}"));
        match st.backups.get(&netbiosname.to_ascii_uppercase()).cloned() {
            Some(backup) => {
                st.live = Some(backup);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn flush_cache(&self) {
        self.state.lock().flushes += 1;
    }
}

#[derive(Debug, Default)]
struct KerberosState {
    cred: Option<KrbCred>,
    kinit_failure: Option<String>,
    calls: Vec<String>,
}

/// In-memory [`Kerberos`]. Only credential caches named like the system
/// cache (`krb5cc_0`) hold the tracked ticket; a successful kinit into one
/// installs a ticket valid for ten hours. Other caches are scratch.
#[derive(Debug, Default)]
pub struct FakeKerberos {
    state: Mutex<KerberosState>,
}

impl FakeKerberos {
    /// Empty credential cache; kinit succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a ticket directly.
    pub fn set_cred(&self, cred: Option<KrbCred>) {
        self.state.lock().cred = cred;
    }

    /// Install a valid ticket for `principal`.
    pub fn set_valid(&self, principal: &str) {
        self.set_cred(Some(KrbCred {
            principal: principal.to_string(),
            expires: chrono::Local::now().naive_local() + chrono::Duration::hours(10),
        }));
    }

    /// Make kinit fail with `reason`, or succeed again with `None`.
    pub fn fail_kinit(&self, reason: Option<&str>) {
        self.state.lock().kinit_failure = reason.map(str::to_string);
    }

    /// Recorded calls, e.g. `kinit TRUENAS$@AD.EXAMPLE.COM kdc=10.0.0.5`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

fn is_system_ccache(ccache: &Path) -> bool {
    ccache.file_name() == Path::new(crate::kerberos::SYSTEM_CCACHE).file_name()
}

#[async_trait]
impl Kerberos for FakeKerberos {
    async fn kinit(&self, cred: &KinitCredential, opts: &KinitOptions) -> CallResult<()> {
        let mut st = self.state.lock();
        let mut call = format!("kinit {}", cred.principal());
        if let Some(kdc) = &opts.kdc {
            call.push_str(&format!(" kdc={kdc}"));
        }
        st.calls.push(call);
        if let Some(reason) = &st.kinit_failure {
            return Err(CallError::new(Errno::EFAULT, reason.clone()));
        }
        if is_system_ccache(&opts.ccache) {
            st.cred = Some(KrbCred {
                principal: cred.principal().to_string(),
                expires: chrono::Local::now().naive_local() + chrono::Duration::hours(10),
            });
        }
        Ok(())
    }

    async fn kdestroy(&self, ccache: &Path) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push("kdestroy".to_string());
        if is_system_ccache(ccache) {
            st.cred = None;
        }
        Ok(())
    }

    async fn current_cred(&self, _ccache: &Path) -> CallResult<Option<KrbCred>> {
        Ok(self.state.lock().cred.clone())
    }

    async fn renew(&self, _ccache: &Path) -> CallResult<()> {
        self.state.lock().calls.push("renew".to_string());
        Ok(())
    }
}

/// In-memory [`Ldap`] returning a fixed root DSE or a scripted error.
#[derive(Debug)]
pub struct FakeLdap {
    result: Mutex<CallResult<Vec<LdapEntry>>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeLdap {
    fn default() -> Self {
        let mut dse = LdapEntry::default();
        dse.attrs
            .insert("namingContexts".to_string(), vec!["dc=example,dc=com".to_string()]);
        Self {
            result: Mutex::new(Ok(vec![dse])),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLdap {
    /// Binds succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make binds fail with `err`, or succeed again with `None`.
    pub fn fail_bind(&self, err: Option<CallError>) {
        *self.result.lock() = match err {
            Some(err) => Err(err),
            None => FakeLdap::default().result.into_inner(),
        };
    }

    /// Recorded calls as `<url> <bind kind>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Ldap for FakeLdap {
    async fn search(
        &self,
        url: &str,
        bind: &LdapBind,
        _base: &str,
        _scope: LdapScope,
        _filter: &str,
        _opts: &LdapOptions,
    ) -> CallResult<Vec<LdapEntry>> {
        let kind = match bind {
            LdapBind::Simple { binddn, .. } => format!("simple:{binddn}"),
            LdapBind::Anonymous => "anonymous".to_string(),
            LdapBind::Gssapi { sealed } => format!("gssapi:sealed={sealed}"),
            LdapBind::Mtls { .. } => "mtls".to_string(),
        };
        self.calls.lock().push(format!("{url} {kind}"));
        self.result.lock().clone()
    }
}

#[derive(Debug)]
struct AdState {
    info: CallResult<DomainInfo>,
    wbclient_failure: Option<String>,
    ping_failure: Option<String>,
    keytab: Option<Vec<u8>>,
    calls: Vec<String>,
}

/// In-memory [`AdService`].
#[derive(Debug)]
pub struct FakeAd {
    state: Mutex<AdState>,
}

impl Default for FakeAd {
    fn default() -> Self {
        Self {
            state: Mutex::new(AdState {
                info: Ok(DomainInfo {
                    ldap_server: "10.0.0.5".to_string(),
                    realm: "AD.EXAMPLE.COM".to_string(),
                    kdc_server: "10.0.0.5".to_string(),
                    server_time_offset: 0,
                }),
                wbclient_failure: None,
                ping_failure: None,
                keytab: None,
                calls: Vec::new(),
            }),
        }
    }
}

impl FakeAd {
    /// A healthy domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the domain info result.
    pub fn set_domain_info(&self, info: CallResult<DomainInfo>) {
        self.state.lock().info = info;
    }

    /// Set the clock offset reported by the domain controller.
    pub fn set_time_offset(&self, seconds: i64) {
        if let Ok(info) = self.state.lock().info.as_mut() {
            info.server_time_offset = seconds;
        }
    }

    /// Make opening the winbind client fail.
    pub fn fail_wbclient(&self, reason: Option<&str>) {
        self.state.lock().wbclient_failure = reason.map(str::to_string);
    }

    /// Make `ping_dc` fail.
    pub fn fail_ping_dc(&self, reason: Option<&str>) {
        self.state.lock().ping_failure = reason.map(str::to_string);
    }

    /// Bytes written by `export_keytab`; `None` makes it fail.
    pub fn set_keytab(&self, keytab: Option<Vec<u8>>) {
        self.state.lock().keytab = keytab;
    }

    /// Recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl AdService for FakeAd {
    async fn domain_info(&self, domain: &str) -> CallResult<DomainInfo> {
        let mut st = self.state.lock();
        st.calls.push(format!("domain_info {domain}"));
        st.info.clone()
    }

    async fn open_wbclient(&self) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push("open_wbclient".to_string());
        match &st.wbclient_failure {
            Some(reason) => Err(CallError::new(Errno::EFAULT, reason.clone())),
            None => Ok(()),
        }
    }

    async fn ping_dc(&self) -> CallResult<()> {
        let mut st = self.state.lock();
        st.calls.push("ping_dc".to_string());
        match &st.ping_failure {
            Some(reason) => Err(CallError::new(Errno::EFAULT, reason.clone())),
            None => Ok(()),
        }
    }

    async fn export_keytab(&self, path: &Path) -> CallResult<()> {
        let keytab = {
            let mut st = self.state.lock();
            st.calls.push("export_keytab".to_string());
            st.keytab.clone()
        };
        match keytab {
            Some(bytes) => Ok(std::fs::write(path, bytes)?),
            None => Err(CallError::new(Errno::EFAULT, "no machine account secret")),
        }
    }
}
