use crate::peer::types::IceCandidate;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Logs a trickled ICE candidate as it appears
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through symmetric NAT may fail.");
    }
    summary
}

/// Remote candidate entries already handed to the transport.
#[derive(Debug, Default)]
pub struct AppliedCandidates {
    seen: HashSet<String>,
}

impl AppliedCandidates {
    /// Returns false if `entry_id` was applied before.
    pub fn mark(&mut self, entry_id: &str) -> bool {
        self.seen.insert(entry_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_summary_counts_types() {
        let summary = analyze_candidates(&[
            cand("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host"),
            cand("candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx raddr 10.0.0.2 rport 50000"),
            cand("candidate:3 1 udp 41885439 198.51.100.9 3478 typ relay raddr 203.0.113.7 rport 50001"),
            cand("candidate:4 1 udp 2122260223 10.0.0.3 50002 typ host"),
        ]);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn test_applied_candidates_dedup() {
        let mut applied = AppliedCandidates::default();
        assert!(applied.mark("e1"));
        assert!(!applied.mark("e1"));
        assert!(applied.mark("e2"));
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_conversion_keeps_fields() {
        let c = cand("candidate:1 1 udp 1 10.0.0.2 1 typ host");
        let init: RTCIceCandidateInit = c.clone().into();
        assert_eq!(IceCandidate::from(init), c);
    }
}
