//! ICE candidates, in both native and compact wire form.

use std::fmt;
use std::str::FromStr;

use super::SdpError;
use crate::calls::signaling::WireCandidate;

/// An ICE candidate as handed to or produced by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// Compact form sent to the peer. End-of-candidates markers have no
    /// wire form.
    pub fn to_wire(&self) -> Option<WireCandidate> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        if line.is_empty() {
            return None;
        }
        Some(WireCandidate {
            sdp_string: line.to_string(),
        })
    }

    /// Rebuilds a candidate from the wire. Everything is bundled on the first
    /// m-line.
    pub fn from_wire(wire: &WireCandidate) -> Result<Self, SdpError> {
        let info: CandidateInfo = wire.sdp_string.parse()?;
        Ok(Self::new(info.to_string()).with_sdp_m_line_index(0))
    }
}

/// ICE candidate type (RFC 5245).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// Parsed `candidate:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    /// Trailing key/value extensions (generation, ufrag, network-id, ...).
    pub extensions: Vec<(String, String)>,
}

impl CandidateInfo {
    pub fn generation(&self) -> Option<u32> {
        self.extension("generation").and_then(|v| v.parse().ok())
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl FromStr for CandidateInfo {
    type Err = SdpError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || SdpError::MalformedCandidate(raw.to_string());

        let line = raw.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let line = line.strip_prefix("candidate:").ok_or_else(malformed)?;
        let mut parts = line.split_whitespace();

        let foundation = parts.next().ok_or_else(malformed)?.to_string();
        let component = parts.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        let protocol = parts.next().ok_or_else(malformed)?.to_lowercase();
        let priority = parts.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        let address = parts.next().ok_or_else(malformed)?.to_string();
        let port = parts.next().and_then(|v| v.parse().ok()).ok_or_else(malformed)?;
        if parts.next() != Some("typ") {
            return Err(malformed());
        }
        let kind = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(malformed)?;

        let mut info = CandidateInfo {
            foundation,
            component,
            protocol,
            priority,
            address,
            port,
            kind,
            related_address: None,
            related_port: None,
            extensions: Vec::new(),
        };

        while let Some(key) = parts.next() {
            let value = parts.next().ok_or_else(malformed)?;
            match key {
                "raddr" => info.related_address = Some(value.to_string()),
                "rport" => info.related_port = Some(value.parse().map_err(|_| malformed())?),
                _ => info.extensions.push((key.to_string(), value.to_string())),
            }
        }
        Ok(info)
    }
}

impl fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )?;
        if let Some(addr) = &self.related_address {
            write!(f, " raddr {}", addr)?;
        }
        if let Some(port) = self.related_port {
            write!(f, " rport {}", port)?;
        }
        for (key, value) in &self.extensions {
            write!(f, " {} {}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRFLX: &str = "candidate:842163049 1 udp 1677729535 203.0.113.7 61209 typ srflx raddr 10.0.0.2 rport 61209 generation 0 ufrag Ufr4 network-cost 999";

    #[test]
    fn test_ice_candidate_builder() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");

        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(candidate.sdp_mid, Some("0".to_string()));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment, Some("abc123".to_string()));
    }

    #[test]
    fn test_parse_srflx() {
        let info: CandidateInfo = SRFLX.parse().unwrap();
        assert_eq!(info.kind, CandidateType::ServerReflexive);
        assert_eq!(info.related_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(info.related_port, Some(61209));
        assert_eq!(info.generation(), Some(0));
        assert_eq!(info.extension("network-cost"), Some("999"));
        assert_eq!(info.to_string(), SRFLX);
    }

    #[test]
    fn test_wire_conversion() {
        let native = IceCandidate::new(format!("a={}", SRFLX)).with_sdp_m_line_index(0);
        let wire = native.to_wire().unwrap();
        assert_eq!(wire.sdp_string, SRFLX);

        let back = IceCandidate::from_wire(&wire).unwrap();
        assert_eq!(back.candidate, SRFLX);
        assert_eq!(back.sdp_m_line_index, Some(0));

        assert!(IceCandidate::new("").to_wire().is_none());
    }

    #[test]
    fn test_malformed_candidates() {
        for bad in [
            "1 1 udp 1 10.0.0.1 5000 typ host",
            "candidate:1 1 udp 1 10.0.0.1",
            "candidate:1 1 udp 1 10.0.0.1 5000 type host",
            "candidate:1 1 udp 1 10.0.0.1 5000 typ bogus",
            "candidate:1 1 udp 1 10.0.0.1 5000 typ host generation",
        ] {
            assert!(bad.parse::<CandidateInfo>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_candidate_type_parsing() {
        assert_eq!("HOST".parse::<CandidateType>(), Ok(CandidateType::Host));
        assert_eq!("relay".parse::<CandidateType>(), Ok(CandidateType::Relay));
        assert!("unknown".parse::<CandidateType>().is_err());
    }
}
