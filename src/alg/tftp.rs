//! C5 TFTP (UDP port 69): simpler than FTP — the first control packet seeds
//! an expectation on the reply direction's source port, and no payload
//! rewrite is performed (`spec.md` §4.5).

use crate::conn::Connection;
use crate::expectation::Expectation;
use crate::key::ConnKey;

use super::{AlgError, AlgHelper, AlgOutcome, AlgPacket};

pub struct TftpHelper;

impl AlgHelper for TftpHelper {
    fn inspect(
        &self,
        _conn: &Connection,
        parent_key: &ConnKey,
        _nat_active: bool,
        pkt: &mut AlgPacket,
    ) -> Result<AlgOutcome, AlgError> {
        if pkt.payload.len() < 2 {
            return Err(AlgError::Malformed);
        }

        let expectation = Expectation::new_tftp(parent_key);
        Ok(AlgOutcome {
            expectation: Some(expectation),
            seq_skew: None,
        })
    }
}
