//! Flash stubs: short native routines executed out of target RAM for
//! controllers that cannot be driven register-by-register from the debug
//! port, or where doing so is too slow.
//!
//! The contract with a stub blob: its parameter block
//! `{destination, size, source, page_size}` sits at a fixed info address;
//! the debugger points PC at the entry, resumes, and the stub halts itself
//! (a breakpoint instruction) when finished, leaving its status in the
//! parameter block.

use std::time::{Duration, Instant};

use super::{FlashError, TargetAccess};
use crate::core::{CoreStatus, RegisterId};

/// The parameter block handed to a stub.
#[derive(Debug, Clone, Copy)]
pub struct StubRequest {
    /// Where the stub should program to.
    pub destination: u32,
    /// Number of bytes to program.
    pub size: u32,
    /// Where the data was staged in RAM.
    pub source: u32,
    /// The controller's page size.
    pub page_size: u32,
}

/// Upload and execute a stub, returning the parameter block as the stub
/// left it. The first word doubles as the status report on every stub we
/// ship.
pub fn run_stub(
    access: &mut dyn TargetAccess,
    stub: &[u8],
    entry: u32,
    info_address: u32,
    request: &StubRequest,
    timeout: Duration,
) -> Result<[u32; 4], FlashError> {
    access.write_8(entry, stub)?;
    access.write_32(
        info_address,
        &[
            request.destination,
            request.size,
            request.source,
            request.page_size,
        ],
    )?;

    // Program counter register 15; the Thumb bit keeps armv6-M parts from
    // faulting on the first fetch.
    access.write_core_reg(RegisterId(15), entry | 1)?;
    access.run()?;

    let deadline = Instant::now() + timeout;
    loop {
        match access.status()? {
            CoreStatus::Halted(_) => break,
            _ if Instant::now() >= deadline => {
                // Regain control before reporting; a spinning stub would
                // otherwise wedge the next operation too.
                access.halt(Duration::from_millis(100))?;
                return Err(FlashError::Timeout);
            }
            _ => {}
        }
    }

    let mut report = [0u32; 4];
    access.read_32(info_address, &mut report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashing::testutil::MockTarget;
    use crate::memory::MemoryInterface;

    #[test]
    fn stub_handoff_follows_the_contract() {
        let mut target = MockTarget {
            polls_until_halt: 2,
            ..Default::default()
        };

        let stub = [0x70, 0x47, 0x00, 0xBE]; // bx lr; bkpt
        let request = StubRequest {
            destination: 0x0800_0000,
            size: 256,
            source: 0x2000_0400,
            page_size: 256,
        };
        let report = run_stub(
            &mut target,
            &stub,
            0x2000_0000,
            0x2000_0020,
            &request,
            Duration::from_millis(100),
        )
        .unwrap();

        assert_eq!(target.resumes, 1);
        assert_eq!(target.pc_writes, vec![0x2000_0001]);
        assert_eq!(target.read_word_8(0x2000_0000).unwrap(), 0x70);
        assert_eq!(report, [0x0800_0000, 256, 0x2000_0400, 256]);
    }
}
