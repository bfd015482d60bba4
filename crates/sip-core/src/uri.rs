use smol_str::SmolStr;

/// A SIP URI reduced to the parts the bridge needs: user, host, port, and
/// trailing parameters kept verbatim.
///
/// ```
/// use sip_core::SipUri;
///
/// let uri = SipUri::parse("sip:30@pbx.example.com:5060;transport=udp").unwrap();
/// assert_eq!(uri.user.as_deref(), Some("30"));
/// assert_eq!(uri.host.as_str(), "pbx.example.com");
/// assert_eq!(uri.port, Some(5060));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    /// Raw `;name=value` parameter tail, without the leading semicolon.
    pub params: Option<SmolStr>,
}

impl SipUri {
    /// Parses a `sip:` URI. Returns `None` for other schemes or empty hosts.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("sip:")?;
        let (addr, params) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Some(SmolStr::new(params))),
            None => (rest, None),
        };
        let (user, hostport) = match addr.split_once('@') {
            Some((user, hostport)) => (Some(SmolStr::new(user)), hostport),
            None => (None, addr),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
            None => (hostport, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            user,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Renders the URI back to its `sip:` form.
    pub fn as_str(&self) -> String {
        let mut out = String::from("sip:");
        if let Some(user) = &self.user {
            out.push_str(user);
            out.push('@');
        }
        out.push_str(&self.host);
        if let Some(port) = self.port {
            out.push(':');
            out.push_str(&port.to_string());
        }
        if let Some(params) = &self.params {
            out.push(';');
            out.push_str(params);
        }
        out
    }

    /// Host:port pair using the SIP default port when none is present.
    pub fn host_port(&self) -> (String, u16) {
        (self.host.to_string(), self.port.unwrap_or(5060))
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}
