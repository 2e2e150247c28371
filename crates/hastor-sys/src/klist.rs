//! Parser for MIT `klist -ef` output.

use crate::error::{CallError, Errno};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

const TIME_FORMATS: [&str; 2] = ["%m/%d/%y %H:%M:%S", "%m/%d/%Y %H:%M:%S"];

/// Kerberos ticket flags as printed by `klist -f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum TicketFlag {
    Forwardable,
    Forwarded,
    Proxiable,
    Proxy,
    MayPostdate,
    Postdated,
    Renewable,
    Initial,
    Invalid,
    PreAuthenticated,
    HwAuthenticated,
    TransitPolicyChecked,
    OkAsDelegate,
    Anonymous,
}

impl TicketFlag {
    /// Decode one flag letter.
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'F' => TicketFlag::Forwardable,
            'f' => TicketFlag::Forwarded,
            'P' => TicketFlag::Proxiable,
            'p' => TicketFlag::Proxy,
            'D' => TicketFlag::MayPostdate,
            'd' => TicketFlag::Postdated,
            'R' => TicketFlag::Renewable,
            'I' => TicketFlag::Initial,
            'i' => TicketFlag::Invalid,
            'A' => TicketFlag::PreAuthenticated,
            'H' => TicketFlag::HwAuthenticated,
            'T' => TicketFlag::TransitPolicyChecked,
            'O' => TicketFlag::OkAsDelegate,
            'a' => TicketFlag::Anonymous,
            _ => return None,
        })
    }
}

/// One ticket in a credential cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Start of validity.
    pub issued: NaiveDateTime,
    /// End of validity.
    pub expires: NaiveDateTime,
    /// Renewal limit, if renewable.
    pub renew_until: Option<NaiveDateTime>,
    /// Client principal (the cache's default principal).
    pub client: Option<String>,
    /// Service principal.
    pub server: String,
    /// Ticket flags.
    pub flags: Vec<TicketFlag>,
    /// Encryption type description.
    pub etype: Option<String>,
}

impl Ticket {
    /// Whether this is a ticket-granting ticket.
    pub fn is_tgt(&self) -> bool {
        self.server.starts_with("krbtgt/")
    }
}

/// Parsed `klist` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlistOutput {
    /// Cache type, e.g. `FILE`.
    pub cache_type: Option<String>,
    /// Cache name, e.g. `/tmp/krb5cc_0`.
    pub cache_name: Option<String>,
    /// Default principal.
    pub default_principal: Option<String>,
    /// Tickets in listing order.
    pub tickets: Vec<Ticket>,
}

impl KlistOutput {
    /// The ticket-granting ticket, if present.
    pub fn tgt(&self) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.is_tgt())
    }
}

fn parse_time(s: &str) -> Result<NaiveDateTime, CallError> {
    let s = s.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| CallError::new(Errno::EINVAL, format!("invalid klist timestamp {s:?}")))
}

fn parse_flags(s: &str) -> Vec<TicketFlag> {
    s.trim().chars().filter_map(TicketFlag::from_char).collect()
}

/// Parse the detail lines that follow a ticket line.
fn parse_detail(line: &str, ticket: &mut Ticket) -> Result<(), CallError> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("renew until ") {
        let (ts, tail) = rest.split_once(',').unwrap_or((rest, ""));
        ticket.renew_until = Some(parse_time(ts)?);
        if let Some(flags) = tail.trim().strip_prefix("Flags:") {
            ticket.flags = parse_flags(flags);
        }
    } else if let Some(rest) = line.strip_prefix("Flags:") {
        let (flags, etype) = rest.split_once(',').unwrap_or((rest, ""));
        ticket.flags = parse_flags(flags);
        let etype = etype.trim();
        if !etype.is_empty() {
            ticket.etype = Some(etype.to_string());
        }
    } else if line.starts_with("Etype") {
        ticket.etype = Some(line.to_string());
    }
    Ok(())
}

/// Parse the output of `klist -ef`.
pub fn parse_klist(output: &str) -> Result<KlistOutput, CallError> {
    let mut parsed = KlistOutput::default();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Ticket cache:") {
            let rest = rest.trim();
            match rest.split_once(':') {
                Some((kind, name)) => {
                    parsed.cache_type = Some(kind.to_string());
                    parsed.cache_name = Some(name.trim().to_string());
                }
                None => parsed.cache_name = Some(rest.to_string()),
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Default principal:") {
            parsed.default_principal = Some(rest.trim().to_string());
            continue;
        }
        if line.starts_with(|c: char| c.is_ascii_digit()) {
            let cols: Vec<&str> = line
                .split("  ")
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            if cols.len() < 3 {
                return Err(CallError::new(
                    Errno::EINVAL,
                    format!("malformed klist ticket line {line:?}"),
                ));
            }
            parsed.tickets.push(Ticket {
                issued: parse_time(cols[0])?,
                expires: parse_time(cols[1])?,
                renew_until: None,
                client: parsed.default_principal.clone(),
                server: cols[2].to_string(),
                flags: Vec::new(),
                etype: None,
            });
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some(ticket) = parsed.tickets.last_mut() {
                parse_detail(line, ticket)?;
            }
        }
    }
    Ok(parsed)
}
