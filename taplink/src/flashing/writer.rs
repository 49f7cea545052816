//! The buffered Flash pipeline.
//!
//! GDB erases in whatever granularity its memory map advertises and writes
//! in small packets; the pipeline turns that into block-aligned erases with
//! a redundant-erase cache, and into `write_size`-aligned programs through
//! a per-region lazy buffer. Low/high watermarks bound the dirty span so a
//! flush only programs what was actually touched, padded with the region's
//! erased byte out to write alignment.

use super::{FlashDriver, FlashError, FlashOperation, FlashRegion, TargetAccess};

/// Per-region pipeline state.
#[derive(Debug, Default)]
struct BankState {
    /// The operation class the driver is currently prepared for.
    operation: Option<FlashOperation>,
    /// Lazy write buffer, allocated on the first write.
    buffer: Option<Vec<u8>>,
    /// Target address of `buffer[0]`.
    buffer_base: u32,
    /// Lowest dirty address, absolute. Meaningless unless `dirty`.
    low_watermark: u32,
    /// One past the highest dirty address.
    high_watermark: u32,
    dirty: bool,
    /// Last block handed to the driver's erase, to skip the re-erase GDB
    /// issues before every same-page write.
    last_erased: Option<u32>,
}

/// One Flash region with its driver and pipeline state.
pub struct FlashBank {
    driver: Box<dyn FlashDriver>,
    state: BankState,
}

impl FlashBank {
    /// Wrap a driver.
    pub fn new(driver: Box<dyn FlashDriver>) -> Self {
        Self {
            driver,
            state: BankState::default(),
        }
    }

    /// The bank's geometry.
    pub fn region(&self) -> FlashRegion {
        *self.driver.region()
    }

    /// Switch the operation class, flushing and closing out the previous
    /// one first.
    fn prepare(
        &mut self,
        access: &mut dyn TargetAccess,
        op: FlashOperation,
    ) -> Result<(), FlashError> {
        if self.state.operation == Some(op) {
            return Ok(());
        }
        if self.state.operation.is_some() {
            self.flush(access)?;
            self.driver.done(access)?;
        }
        self.driver.prepare(access, op)?;
        self.state.operation = Some(op);
        Ok(())
    }

    /// Program the dirty span, padded out to write alignment.
    fn flush(&mut self, access: &mut dyn TargetAccess) -> Result<(), FlashError> {
        if !self.state.dirty {
            return Ok(());
        }
        let region = *self.driver.region();
        let write_mask = region.write_size - 1;

        let span_start = self.state.low_watermark & !write_mask;
        let span_end = (self.state.high_watermark + write_mask) & !write_mask;

        let from = (span_start - self.state.buffer_base) as usize;
        let to = (span_end - self.state.buffer_base) as usize;
        let buffer = self.state.buffer.as_mut().expect("dirty bank without a buffer");

        tracing::debug!(
            "flushing {:#010x}..{:#010x} ({} bytes)",
            span_start,
            span_end,
            to - from
        );
        self.driver.write(access, span_start, &buffer[from..to])?;

        // The buffer stays allocated; scrub it back to erased state.
        buffer.fill(region.erased_byte);
        self.state.dirty = false;
        Ok(())
    }

    /// Buffer `data` at `address`, flushing whenever the window moves.
    fn buffered_write(
        &mut self,
        access: &mut dyn TargetAccess,
        mut address: u32,
        mut data: &[u8],
    ) -> Result<(), FlashError> {
        let region = *self.driver.region();
        let buf_size = region.write_buf_size;

        while !data.is_empty() {
            let window_base = address & !(buf_size - 1);
            if self.state.buffer.is_none() {
                self.state.buffer = Some(vec![region.erased_byte; buf_size as usize]);
                self.state.buffer_base = window_base;
            } else if self.state.buffer_base != window_base {
                self.flush(access)?;
                self.state.buffer_base = window_base;
            }

            let offset = (address - self.state.buffer_base) as usize;
            let room = buf_size as usize - offset;
            let chunk = room.min(data.len());

            let buffer = self.state.buffer.as_mut().expect("buffer allocated above");
            buffer[offset..offset + chunk].copy_from_slice(&data[..chunk]);

            if self.state.dirty {
                self.state.low_watermark = self.state.low_watermark.min(address);
                self.state.high_watermark = self.state.high_watermark.max(address + chunk as u32);
            } else {
                self.state.low_watermark = address;
                self.state.high_watermark = address + chunk as u32;
                self.state.dirty = true;
            }

            address += chunk as u32;
            data = &data[chunk..];
        }
        Ok(())
    }

    /// Flush and close out the current operation class.
    fn complete(&mut self, access: &mut dyn TargetAccess) -> Result<(), FlashError> {
        if self.state.operation.is_none() {
            return Ok(());
        }
        let flush_result = self.flush(access);
        // `done` runs even when the flush failed: the controller must be
        // relocked either way.
        let done_result = self.driver.done(access);
        self.state.operation = None;
        self.state.last_erased = None;
        self.state.buffer = None;
        flush_result?;
        done_result
    }
}

/// All the Flash banks of one target, plus the pipeline entry points.
#[derive(Default)]
pub struct FlashContext {
    banks: Vec<FlashBank>,
}

impl FlashContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region's driver. Called by vendor probes.
    pub fn add_bank(&mut self, driver: Box<dyn FlashDriver>) {
        self.banks.push(FlashBank::new(driver));
    }

    /// Whether any bank is registered.
    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// The region descriptors, for the memory map.
    pub fn regions(&self) -> Vec<FlashRegion> {
        self.banks.iter().map(|bank| bank.region()).collect()
    }

    fn bank_for(&mut self, address: u32) -> Result<&mut FlashBank, FlashError> {
        self.banks
            .iter_mut()
            .find(|bank| bank.region().contains(address))
            .ok_or(FlashError::OutOfRegion { address })
    }

    /// Erase every block overlapping `address..address + length`, rounding
    /// outward to block boundaries.
    pub fn erase(
        &mut self,
        access: &mut dyn TargetAccess,
        address: u32,
        length: u32,
    ) -> Result<(), FlashError> {
        let mut cursor = address;
        let end = address + length;

        while cursor < end {
            let bank = self.bank_for(cursor)?;
            let region = bank.region();
            bank.prepare(access, FlashOperation::Erase)?;

            // The block grid is anchored at the region start, so banks
            // with different block sizes compose.
            let mut block = cursor - (cursor - region.start) % region.block_size;
            while block < end && block < region.end() {
                if bank.state.last_erased != Some(block) {
                    tracing::debug!("erasing block at {block:#010x}");
                    bank.driver.erase(access, block)?;
                    bank.state.last_erased = Some(block);
                }
                block += region.block_size;
            }
            cursor = block;
        }
        Ok(())
    }

    /// Write `data` at `address` through the region's lazy buffer.
    pub fn write(
        &mut self,
        access: &mut dyn TargetAccess,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let mut cursor = address;
        let mut remaining = data;

        while !remaining.is_empty() {
            let bank = self.bank_for(cursor)?;
            let region = bank.region();
            bank.prepare(access, FlashOperation::Write)?;

            let in_region = (region.end() - cursor) as usize;
            let chunk = in_region.min(remaining.len());
            bank.buffered_write(access, cursor, &remaining[..chunk])?;

            cursor += chunk as u32;
            remaining = &remaining[chunk..];
        }
        Ok(())
    }

    /// Mass-erase every bank that supports it.
    pub fn mass_erase(&mut self, access: &mut dyn TargetAccess) -> Result<(), FlashError> {
        for bank in &mut self.banks {
            bank.prepare(access, FlashOperation::MassErase)?;
            bank.driver.mass_erase(access)?;
            bank.complete(access)?;
        }
        Ok(())
    }

    /// Flush every dirty buffer and run `done` once per prepared bank.
    ///
    /// Every bank is completed even when an earlier one fails; the first
    /// error is reported.
    pub fn complete(&mut self, access: &mut dyn TargetAccess) -> Result<(), FlashError> {
        let mut first_error = None;
        for bank in &mut self.banks {
            if let Err(e) = bank.complete(access) {
                tracing::warn!("flash bank completion failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flashing::testutil::MockTarget;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// What the mock driver saw, shared with the test body.
    #[derive(Debug, Default)]
    struct DriverLog {
        prepares: Vec<FlashOperation>,
        erases: Vec<u32>,
        writes: Vec<(u32, Vec<u8>)>,
        dones: usize,
    }

    struct MockDriver {
        region: FlashRegion,
        log: Rc<RefCell<DriverLog>>,
    }

    impl MockDriver {
        fn new(region: FlashRegion) -> (Self, Rc<RefCell<DriverLog>>) {
            let log = Rc::new(RefCell::new(DriverLog::default()));
            (
                Self {
                    region,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl FlashDriver for MockDriver {
        fn region(&self) -> &FlashRegion {
            &self.region
        }
        fn prepare(
            &mut self,
            _access: &mut dyn TargetAccess,
            op: FlashOperation,
        ) -> Result<(), FlashError> {
            self.log.borrow_mut().prepares.push(op);
            Ok(())
        }
        fn erase(
            &mut self,
            _access: &mut dyn TargetAccess,
            block_address: u32,
        ) -> Result<(), FlashError> {
            self.log.borrow_mut().erases.push(block_address);
            Ok(())
        }
        fn write(
            &mut self,
            _access: &mut dyn TargetAccess,
            address: u32,
            data: &[u8],
        ) -> Result<(), FlashError> {
            self.log.borrow_mut().writes.push((address, data.to_vec()));
            Ok(())
        }
        fn done(&mut self, _access: &mut dyn TargetAccess) -> Result<(), FlashError> {
            self.log.borrow_mut().dones += 1;
            Ok(())
        }
    }

    fn region() -> FlashRegion {
        FlashRegion {
            start: 0x0801_0000,
            length: 0x1_0000,
            block_size: 0x800,
            write_size: 4,
            write_buf_size: 256,
            erased_byte: 0xFF,
        }
    }

    fn context() -> (FlashContext, Rc<RefCell<DriverLog>>) {
        let (driver, log) = MockDriver::new(region());
        let mut context = FlashContext::new();
        context.add_bank(Box::new(driver));
        (context, log)
    }

    #[test]
    fn erase_rounds_to_blocks_and_caches() {
        let (mut context, log) = context();
        let mut target = MockTarget::default();

        // Four bytes at an odd offset erase exactly one block.
        context.erase(&mut target, 0x0801_0804, 4).unwrap();
        assert_eq!(log.borrow().erases, vec![0x0801_0800]);

        // GDB re-erasing the same page before a write is elided.
        context.erase(&mut target, 0x0801_0800, 4).unwrap();
        assert_eq!(log.borrow().erases.len(), 1);

        // A span straddling block boundaries erases each block once.
        context.erase(&mut target, 0x0801_17FC, 8).unwrap();
        assert_eq!(
            log.borrow().erases,
            vec![0x0801_0800, 0x0801_1000, 0x0801_1800]
        );
    }

    #[test]
    fn buffered_write_pads_to_write_alignment() {
        let (mut context, log) = context();
        let mut target = MockTarget::default();

        // Six bytes two past a write boundary.
        context
            .write(&mut target, 0x0801_0002, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
            .unwrap();
        // Nothing programmed yet; the buffer holds it.
        assert!(log.borrow().writes.is_empty());

        context.complete(&mut target).unwrap();
        let expected: Vec<u8> = vec![0xFF, 0xFF, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        assert_eq!(log.borrow().writes, vec![(0x0801_0000, expected)]);
        assert_eq!(log.borrow().dones, 1);
    }

    #[test]
    fn crossing_the_buffer_boundary_flushes_first() {
        let (mut context, log) = context();
        let mut target = MockTarget::default();

        // 8 bytes ending exactly at the 256-byte window edge, then 4 more.
        context.write(&mut target, 0x0801_00F8, &[0xAA; 8]).unwrap();
        context.write(&mut target, 0x0801_0100, &[0xBB; 4]).unwrap();

        // The first window was flushed by the boundary crossing.
        assert_eq!(log.borrow().writes, vec![(0x0801_00F8, vec![0xAA; 8])]);

        context.complete(&mut target).unwrap();
        assert_eq!(log.borrow().writes[1], (0x0801_0100, vec![0xBB; 4]));
    }

    #[test]
    fn erase_then_write_switches_operation_class() {
        let (mut context, log) = context();
        let mut target = MockTarget::default();

        context.erase(&mut target, 0x0801_0000, 4).unwrap();
        context.write(&mut target, 0x0801_0000, &[1, 2, 3, 4]).unwrap();
        context.complete(&mut target).unwrap();

        let log = log.borrow();
        assert_eq!(
            log.prepares,
            vec![FlashOperation::Erase, FlashOperation::Write]
        );
        // done: once for the class switch, once for completion.
        assert_eq!(log.dones, 2);
    }

    #[test]
    fn complete_runs_done_exactly_once_per_prepared_bank() {
        let (mut context, log) = context();
        let mut target = MockTarget::default();

        context.write(&mut target, 0x0801_0000, &[9; 4]).unwrap();
        context.complete(&mut target).unwrap();
        context.complete(&mut target).unwrap();
        assert_eq!(log.borrow().dones, 1);
    }

    #[test]
    fn writes_outside_every_region_are_rejected() {
        let (mut context, _log) = context();
        let mut target = MockTarget::default();

        let err = context.write(&mut target, 0x2000_0000, &[0]).unwrap_err();
        assert!(matches!(
            err,
            FlashError::OutOfRegion {
                address: 0x2000_0000
            }
        ));
    }
}
