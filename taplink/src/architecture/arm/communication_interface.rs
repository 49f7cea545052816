//! The debug-port session: typed register access, SELECT caching, power-up
//! and sticky-error recovery.

use std::time::{Duration, Instant};

use jep106::JEP106Code;

use super::ap::{Base, Cfg, Csw, Idr, MemoryAp};
use super::dp::{
    Abort, CtrlStat, DebugPortId, DebugPortVersion, Dpidr, Select, Select1, TargetId,
};
use super::memory::AdiMemoryInterface;
use super::{
    ApAddress, ApRegister, ArmError, DapError, DpAddress, DpBankSel, DpRegister,
    FullyQualifiedApAddress, PortType, RawDapAccess, Register,
};

/// How long we wait for the power-up acknowledges.
const POWER_UP_TIMEOUT: Duration = Duration::from_millis(100);

/// ADIv6 moves the MEM-AP register file to this offset inside the AP's
/// 4 KiB frame.
const ADIV6_AP_REGISTER_BASE: u64 = 0xD00;

/// Typed register access to a debug port and its access ports.
pub trait DapAccess {
    /// Read a DP register.
    fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, ArmError>;

    /// Write a DP register.
    fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError>;

    /// Read an AP register.
    fn read_ap_register<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
    ) -> Result<R, ArmError>;

    /// Write an AP register.
    fn write_ap_register<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        register: R,
    ) -> Result<(), ArmError>;

    /// Read one AP register repeatedly (DRW bursts).
    fn read_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError>;

    /// Write one AP register repeatedly (DRW bursts).
    fn write_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        values: &[u32],
    ) -> Result<(), ArmError>;
}

/// The cached SELECT state, per DP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectCache {
    /// ADIv5: APSEL/APBANKSEL/DPBANKSEL in one register.
    V1(Select),
    /// ADIv6: SELECT carries AP address bits [31:4] plus DPBANKSEL,
    /// SELECT1 the upper word.
    V2 {
        select: u32,
        select1: u32,
        select1_known: bool,
    },
}

/// A connected debug port with powered-up debug domain.
#[derive(Debug)]
pub struct ArmCommunicationInterface<P: RawDapAccess> {
    probe: P,
    dp: DpAddress,
    dp_id: DebugPortId,
    target_id: Option<TargetId>,
    select: SelectCache,
    fault: bool,
}

impl<P: RawDapAccess> ArmCommunicationInterface<P> {
    /// Connect to `dp`: wire bring-up, SELECT normalisation, sticky-error
    /// clear and debug power-up.
    pub fn connect(mut probe: P, dp: DpAddress) -> Result<Self, ArmError> {
        let raw_dpidr = probe.connect(dp)?;
        let dp_id: DebugPortId = Dpidr::from(raw_dpidr).into();
        tracing::info!(
            "connected to DPIDR {raw_dpidr:#010x} (designer {:?}), version {}",
            dp_id.designer.get(),
            dp_id.version
        );

        // Normalise SELECT so the bank caches start from known state.
        probe.raw_write_register(PortType::DebugPort, Select::ADDRESS, 0)?;

        let select = if dp_id.version.is_adiv6() {
            SelectCache::V2 {
                select: 0,
                select1: 0,
                select1_known: false,
            }
        } else {
            SelectCache::V1(Select::default())
        };

        let mut iface = Self {
            probe,
            dp,
            dp_id,
            target_id: None,
            select,
            fault: false,
        };

        // A left-over sticky error would fail the power-up writes.
        iface.clear_sticky_errors()?;
        iface.power_up_debug_domain()?;

        if matches!(
            iface.dp_id.version,
            DebugPortVersion::DPv2 | DebugPortVersion::DPv3
        ) {
            let target_id: TargetId = iface.read_dp_register()?;
            tracing::debug!(
                "TARGETID: designer {:#x}, part {:#x}",
                target_id.tdesigner(),
                target_id.tpartno()
            );
            iface.target_id = Some(target_id);
        }

        Ok(iface)
    }

    /// The DP this interface talks to.
    pub fn dp_address(&self) -> DpAddress {
        self.dp
    }

    /// Decoded DPIDR contents.
    pub fn debug_port_id(&self) -> &DebugPortId {
        &self.dp_id
    }

    /// TARGETID contents, for DPv2 multidrop parts.
    pub fn target_id(&self) -> Option<&TargetId> {
        self.target_id.as_ref()
    }

    /// Whether a FAULT was seen since the last recovery.
    pub fn fault(&self) -> bool {
        self.fault
    }

    /// Direct access to the transport.
    pub fn probe_mut(&mut self) -> &mut P {
        &mut self.probe
    }

    /// Release the transport.
    pub fn into_probe(self) -> P {
        self.probe
    }

    /// Request debug and system power and poll the acknowledges.
    fn power_up_debug_domain(&mut self) -> Result<(), ArmError> {
        let mut ctrl = CtrlStat::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        self.write_dp_register(ctrl)?;

        let deadline = Instant::now() + POWER_UP_TIMEOUT;
        loop {
            let stat: CtrlStat = self.read_dp_register()?;
            if stat.cdbgpwrupack() && stat.csyspwrupack() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!("debug power-up acknowledge timed out");
                return Err(ArmError::Timeout);
            }
        }
    }

    /// Clear the sticky error flags and the fault latch, returning the
    /// CTRL/STAT error bits that were set.
    ///
    /// Talks to the transport directly so the recovery cannot recurse into
    /// itself through the typed accessors.
    pub fn clear_sticky_errors(&mut self) -> Result<u32, ArmError> {
        self.select_dp_bank(DpBankSel::Bank(0), CtrlStat::ADDRESS)?;
        let ctrl = self
            .probe
            .raw_read_register(PortType::DebugPort, CtrlStat::ADDRESS)?;
        let errors = ctrl & CtrlStat::STICKY_ERROR_MASK;

        let mut abort = Abort::default();
        abort.set_orunerrclr(true);
        abort.set_wderrclr(true);
        abort.set_stkerrclr(true);
        abort.set_stkcmpclr(true);
        self.probe
            .raw_write_register(PortType::DebugPort, Abort::ADDRESS, abort.into())?;

        self.fault = false;
        Ok(errors)
    }

    /// Write ABORT with an explicit flag set.
    pub fn abort(&mut self, abort: Abort) -> Result<(), ArmError> {
        self.write_dp_register(abort)
    }

    /// Route a raw-access failure: a FAULT runs the sticky-error recovery
    /// so the DP is usable again, then latches the fault flag.
    fn process_error(&mut self, error: ArmError) -> ArmError {
        if let ArmError::Dap(DapError::FaultResponse) = error {
            match self.clear_sticky_errors() {
                Ok(errors) => tracing::debug!("cleared sticky errors after FAULT: {errors:#x}"),
                Err(e) => tracing::warn!("sticky error recovery failed: {e}"),
            }
            self.fault = true;
        }
        error
    }

    /// Make sure DPBANKSEL routes the upcoming DP access.
    fn select_dp_bank(&mut self, bank: DpBankSel, address: u8) -> Result<(), ArmError> {
        let DpBankSel::Bank(bank) = bank else {
            return Ok(());
        };
        // Only address 0x4 (and 0x0 on ADIv6) is banked.
        if address != 0x0 && address != 0x4 {
            return Ok(());
        }

        match &mut self.select {
            SelectCache::V1(select) => {
                if select.dp_bank_sel() != bank {
                    select.set_dp_bank_sel(bank);
                    let raw = u32::from(*select);
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select::ADDRESS, raw)?;
                }
            }
            SelectCache::V2 { select, .. } => {
                if *select & 0xF != bank as u32 {
                    *select = *select & !0xF | bank as u32;
                    let raw = *select;
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select::ADDRESS, raw)?;
                }
            }
        }
        Ok(())
    }

    /// Point SELECT (and SELECT1) at the AP register `address`, returning
    /// the in-bank address for the raw access.
    fn select_ap_bank(&mut self, ap: ApAddress, address: u64) -> Result<u8, ArmError> {
        match (ap, &mut self.select) {
            (ApAddress::V1(port), SelectCache::V1(select)) => {
                let bank = (address as u8) >> 4;
                if select.ap_sel() != port || select.ap_bank_sel() != bank {
                    select.set_ap_sel(port);
                    select.set_ap_bank_sel(bank);
                    let raw = u32::from(*select);
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select::ADDRESS, raw)?;
                }
                Ok((address & 0xF) as u8)
            }
            (
                ApAddress::V2(base),
                SelectCache::V2 {
                    select,
                    select1,
                    select1_known,
                },
            ) => {
                let full = base + address;
                let upper = (full >> 32) as u32;
                let lower = (full & 0xFFFF_FFF0) as u32;

                if upper != *select1 || !*select1_known {
                    // SELECT1 sits behind DPBANKSEL 5.
                    let routed = lower | 0x5;
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select::ADDRESS, routed)?;
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select1::ADDRESS, upper)?;
                    *select = routed;
                    *select1 = upper;
                    *select1_known = true;
                }
                if *select & 0xFFFF_FFF0 != lower {
                    let routed = lower | *select & 0xF;
                    self.probe
                        .raw_write_register(PortType::DebugPort, Select::ADDRESS, routed)?;
                    *select = routed;
                }
                Ok((full & 0xF) as u8)
            }
            _ => Err(ArmError::NotSupported(
                "AP address scheme does not match the DP version",
            )),
        }
    }

    fn ap_register_address<R: ApRegister>(ap: ApAddress) -> u64 {
        match ap {
            ApAddress::V1(_) => R::ADDRESS as u64,
            ApAddress::V2(_) => ADIV6_AP_REGISTER_BASE + R::ADDRESS as u64,
        }
    }

    /// ADIv5 AP discovery: probe APSELs in order until one reads IDR == 0.
    pub fn valid_access_ports(&mut self) -> Result<Vec<FullyQualifiedApAddress>, ArmError> {
        let mut found = Vec::new();
        for apsel in 0..=255u8 {
            let address = FullyQualifiedApAddress::new(self.dp, ApAddress::V1(apsel));
            let idr: Idr = self.read_ap_register(&address)?;
            if u32::from(idr) == 0 {
                break;
            }
            tracing::debug!("AP {apsel}: IDR {:#010x}", u32::from(idr));
            found.push(address);
        }
        Ok(found)
    }

    /// Build a MEM-AP record: read its identity, preserve the bus
    /// attributes and probe for packed-transfer support.
    pub fn memory_ap(&mut self, address: &FullyQualifiedApAddress) -> Result<MemoryAp, ArmError> {
        let idr: Idr = self.read_ap_register(address)?;
        if !idr.is_memory_ap() {
            return Err(ArmError::NotSupported("not a MEM-AP"));
        }
        let base: Base = self.read_ap_register(address)?;
        let cfg: Cfg = self.read_ap_register(address)?;

        // Read-modify-write keeps the device-programmed PROT/TYPE nibbles.
        let device_csw: Csw = self.read_ap_register(address)?;
        let mut probe_csw = device_csw;
        probe_csw.set_size(Csw::SIZE_8);
        probe_csw.set_addr_inc(Csw::ADDR_INC_PACKED);
        self.write_ap_register(address, probe_csw)?;
        let readback: Csw = self.read_ap_register(address)?;
        let supports_packed = readback.addr_inc() == Csw::ADDR_INC_PACKED;

        // Keep only the bus attributes for the template; size and increment
        // are per-transfer business.
        let mut template_csw = device_csw;
        template_csw.set_size(0);
        template_csw.set_addr_inc(0);

        Ok(MemoryAp {
            address: *address,
            idr,
            base,
            supports_packed,
            large_address: cfg.la(),
            template_csw,
            cached_csw: None,
        })
    }

    /// A memory interface over `ap`.
    pub fn memory_interface(
        &mut self,
        ap: MemoryAp,
    ) -> Result<AdiMemoryInterface<'_, P>, ArmError> {
        Ok(AdiMemoryInterface::new(self, ap))
    }
}

impl<P: RawDapAccess> DapAccess for ArmCommunicationInterface<P> {
    fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, ArmError> {
        self.select_dp_bank(R::BANK, R::ADDRESS)?;
        let raw = self
            .probe
            .raw_read_register(PortType::DebugPort, R::ADDRESS)
            .map_err(|e| self.process_error(e))?;
        tracing::trace!("read {} = {raw:#010x}", R::NAME);
        Ok(R::from(raw))
    }

    fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), ArmError> {
        self.select_dp_bank(R::BANK, R::ADDRESS)?;
        let raw: u32 = register.into();
        tracing::trace!("write {} = {raw:#010x}", R::NAME);

        // Keep the SELECT cache coherent when SELECT itself is written.
        if R::ADDRESS == Select::ADDRESS {
            match &mut self.select {
                SelectCache::V1(select) => *select = Select::from(raw),
                SelectCache::V2 { select, .. } => *select = raw,
            }
        }

        self.probe
            .raw_write_register(PortType::DebugPort, R::ADDRESS, raw)
            .map_err(|e| self.process_error(e))
    }

    fn read_ap_register<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
    ) -> Result<R, ArmError> {
        let address = Self::ap_register_address::<R>(ap.ap());
        let in_bank = self.select_ap_bank(ap.ap(), address)?;
        let raw = self
            .probe
            .raw_read_register(PortType::AccessPort, in_bank)
            .map_err(|e| self.process_error(e))?;
        tracing::trace!("read AP {} = {raw:#010x}", R::NAME);
        Ok(R::from(raw))
    }

    fn write_ap_register<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        register: R,
    ) -> Result<(), ArmError> {
        let address = Self::ap_register_address::<R>(ap.ap());
        let in_bank = self.select_ap_bank(ap.ap(), address)?;
        let raw: u32 = register.into();
        tracing::trace!("write AP {} = {raw:#010x}", R::NAME);
        self.probe
            .raw_write_register(PortType::AccessPort, in_bank, raw)
            .map_err(|e| self.process_error(e))
    }

    fn read_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        values: &mut [u32],
    ) -> Result<(), ArmError> {
        let address = Self::ap_register_address::<R>(ap.ap());
        let in_bank = self.select_ap_bank(ap.ap(), address)?;
        self.probe
            .raw_read_block(PortType::AccessPort, in_bank, values)
            .map_err(|e| self.process_error(e))
    }

    fn write_ap_register_repeated<R: ApRegister>(
        &mut self,
        ap: &FullyQualifiedApAddress,
        values: &[u32],
    ) -> Result<(), ArmError> {
        let address = Self::ap_register_address::<R>(ap.ap());
        let in_bank = self.select_ap_bank(ap.ap(), address)?;
        self.probe
            .raw_write_block(PortType::AccessPort, in_bank, values)
            .map_err(|e| self.process_error(e))
    }
}

/// Summary of the chip as visible from the DP, used to pick a target
/// driver.
#[derive(Debug, Clone, Copy)]
pub struct ArmChipInfo {
    /// JEP-106 code of the part's designer.
    pub designer: JEP106Code,
    /// Designer-assigned part number.
    pub part: u16,
}

impl std::fmt::Display for ArmChipInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.designer.get() {
            Some(name) => write!(f, "{} {:#06x}", name, self.part),
            None => write!(
                f,
                "<unknown designer (cc={:#04x}, id={:#04x})> {:#06x}",
                self.designer.cc, self.designer.id, self.part
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm::dap::SwdDapInterface;
    use crate::probe::fake::{SimDap, SwdTargetSim};

    fn connected() -> ArmCommunicationInterface<SwdDapInterface<SwdTargetSim>> {
        let transport = SwdDapInterface::new(SwdTargetSim::new(SimDap::new()));
        ArmCommunicationInterface::connect(transport, DpAddress::Default).unwrap()
    }

    #[test]
    fn connect_powers_up_the_debug_domain() {
        let mut iface = connected();
        assert_eq!(iface.debug_port_id().version, DebugPortVersion::DPv1);
        let ctrl: CtrlStat = iface.read_dp_register().unwrap();
        assert!(ctrl.cdbgpwrupreq() && ctrl.csyspwrupreq());
    }

    #[test]
    fn ap_discovery_stops_at_first_empty_slot() {
        let mut iface = connected();
        let aps = iface.valid_access_ports().unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].ap(), ApAddress::V1(0));
    }

    #[test]
    fn memory_ap_probes_packed_support_and_keeps_prot() {
        let mut iface = connected();
        let ap_address = FullyQualifiedApAddress::v1_with_default_dp(0);
        let ap = iface.memory_ap(&ap_address).unwrap();
        assert!(ap.supports_packed);

        // And a target whose AP refuses packed mode reports that.
        let transport = {
            let mut dap = SimDap::new();
            dap.supports_packed = false;
            SwdDapInterface::new(SwdTargetSim::new(dap))
        };
        let mut iface = ArmCommunicationInterface::connect(transport, DpAddress::Default).unwrap();
        let ap = iface.memory_ap(&ap_address).unwrap();
        assert!(!ap.supports_packed);
    }

    #[test]
    fn fault_recovery_clears_sticky_errors() {
        let mut iface = connected();
        iface.probe_mut().probe_mut().dap.inject_fault();

        let ap_address = FullyQualifiedApAddress::v1_with_default_dp(0);
        let result: Result<Idr, _> = iface.read_ap_register(&ap_address);
        assert!(result.is_err());
        assert!(iface.fault());

        // The recovery already ran, so the next access goes through.
        assert!(!iface.probe_mut().probe_mut().dap.sticky_error());
        let idr: Idr = iface.read_ap_register(&ap_address).unwrap();
        assert_eq!(u32::from(idr), 0x2477_0011);
    }

    #[test]
    fn select_writes_are_cached() {
        let mut iface = connected();
        let ap_address = FullyQualifiedApAddress::v1_with_default_dp(0);

        let _: Idr = iface.read_ap_register(&ap_address).unwrap();
        let select_writes = |sim: &SimDap| {
            sim.access_log
                .iter()
                .filter(|(ap, read, addr)| !ap && !read && *addr == 0x8)
                .count()
        };
        let before = select_writes(&iface.probe_mut().probe_mut().dap);
        // Same bank again: no SELECT traffic.
        let _: Idr = iface.read_ap_register(&ap_address).unwrap();
        assert_eq!(select_writes(&iface.probe_mut().probe_mut().dap), before);
        // Different bank: exactly one more SELECT write.
        let _: Csw = iface.read_ap_register(&ap_address).unwrap();
        assert_eq!(
            select_writes(&iface.probe_mut().probe_mut().dap),
            before + 1
        );
    }

    /// A scripted DPv3 transport that records every raw access.
    struct RecordingV3Dap {
        select: u32,
        writes: Vec<(PortType, u8, u32)>,
    }

    impl RecordingV3Dap {
        fn new() -> Self {
            Self {
                select: 0,
                writes: Vec::new(),
            }
        }
    }

    impl crate::architecture::arm::RawDapAccess for RecordingV3Dap {
        fn raw_read_register(&mut self, port: PortType, address: u8) -> Result<u32, ArmError> {
            Ok(match (port, address) {
                // DPIDR with the version nibble at 3.
                (PortType::DebugPort, 0x0) => 0x2BA0_3477,
                (PortType::DebugPort, 0x4) => match self.select & 0xF {
                    // CTRL/STAT with the power-up acks raised.
                    0 => 0xF000_0000,
                    // TARGETID.
                    2 => 0x0100_0477,
                    _ => 0,
                },
                (PortType::AccessPort, _) => 0x2477_0011,
                _ => 0,
            })
        }

        fn raw_write_register(
            &mut self,
            port: PortType,
            address: u8,
            value: u32,
        ) -> Result<(), ArmError> {
            if port == PortType::DebugPort && address == 0x8 {
                self.select = value;
            }
            self.writes.push((port, address, value));
            Ok(())
        }

        fn connect(&mut self, _dp: DpAddress) -> Result<u32, ArmError> {
            Ok(0x2BA0_3477)
        }

        fn reset_line_state(&mut self) {}

        fn protocol(&self) -> crate::probe::WireProtocol {
            crate::probe::WireProtocol::Swd
        }
    }

    #[test]
    fn adiv6_ap_access_routes_select1_then_select() {
        let mut iface =
            ArmCommunicationInterface::connect(RecordingV3Dap::new(), DpAddress::Default).unwrap();
        assert!(iface.debug_port_id().version.is_adiv6());

        // An AP at the 64-bit address 0x1_0000_0000: IDR sits at
        // +0xD00 + 0xFC inside the AP frame.
        let ap = FullyQualifiedApAddress::v2_with_default_dp(0x1_0000_0000);
        let before = iface.probe_mut().writes.len();
        let _: Idr = iface.read_ap_register(&ap).unwrap();

        let writes = iface.probe_mut().writes.clone();
        // SELECT routes DPBANKSEL to 5 and carries AP address bits [31:4],
        // then SELECT1 takes the upper word.
        assert_eq!(writes[before], (PortType::DebugPort, 0x8, 0xDF5));
        assert_eq!(writes[before + 1], (PortType::DebugPort, 0x4, 0x0000_0001));

        // A second register in the same frame only moves SELECT.
        let before = iface.probe_mut().writes.len();
        let _: Csw = iface.read_ap_register(&ap).unwrap();
        let writes = iface.probe_mut().writes.clone();
        assert_eq!(writes[before], (PortType::DebugPort, 0x8, 0xD05));
        assert_eq!(writes.len(), before + 1);
    }
}
