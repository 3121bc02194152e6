//! MCP2515 stand-alone CAN controller over SPI (BMS bus).
//!
//! Written against the `embedded-hal` 1.0 [`SpiDevice`] trait so the same
//! driver runs on the ESP-IDF SPI master and on a recording fake in tests.
//!
//! Setup: 8 MHz crystal, 250 kbit/s, both receive buffers filtered to the
//! three extended IDs the BMS sends us.  Everything else is dropped in
//! hardware.
//!
//! ```text
//!  RXB0 ◀─ mask 0 ─ RXF0/RXF1: 0x1806E5F4 (limits)      rollover ─┐
//!  RXB1 ◀─ mask 1 ─ RXF2: 0x160B8001  RXF3-5: 0x160D8001  ◀────────┘
//! ```

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

use crate::can::ids;
use crate::can::{BusState, CanFrame, EXT_ID_MASK};

// ── SPI instructions ──────────────────────────────────────────
const INSTR_RESET: u8 = 0xC0;
const INSTR_READ: u8 = 0x03;
const INSTR_WRITE: u8 = 0x02;
const INSTR_BIT_MODIFY: u8 = 0x05;
const INSTR_READ_STATUS: u8 = 0xA0;
const INSTR_READ_RX: [u8; 2] = [0x90, 0x94];
const INSTR_LOAD_TX: [u8; 3] = [0x40, 0x42, 0x44];
const INSTR_RTS: [u8; 3] = [0x81, 0x82, 0x84];

// ── Registers ─────────────────────────────────────────────────
const REG_CANSTAT: u8 = 0x0E;
const REG_CANCTRL: u8 = 0x0F;
const REG_CNF3: u8 = 0x28;
const REG_CANINTE: u8 = 0x2B;
const REG_EFLG: u8 = 0x2D;
const REG_RXB0CTRL: u8 = 0x60;
const REG_RXB1CTRL: u8 = 0x70;
const REG_RXF: [u8; 6] = [0x00, 0x04, 0x08, 0x10, 0x14, 0x18];
const REG_RXM: [u8; 2] = [0x20, 0x24];

// ── Bits ──────────────────────────────────────────────────────
const MODE_MASK: u8 = 0xE0;
const MODE_NORMAL: u8 = 0x00;
const MODE_CONFIG: u8 = 0x80;

const SIDL_EXIDE: u8 = 0x08;
const RXB0_BUKT: u8 = 0x04;
const INTE_RX0IE_RX1IE: u8 = 0x03;

const EFLG_TXBO: u8 = 0x20;
const EFLG_TXEP: u8 = 0x10;
const EFLG_RXEP: u8 = 0x08;

const STATUS_RX0IF: u8 = 0x01;
const STATUS_RX1IF: u8 = 0x02;
const STATUS_TXREQ: [u8; 3] = [0x04, 0x10, 0x40];

/// CNF1..3 for 250 kbit/s from an 8 MHz crystal.
const CNF_250K_8MHZ: [u8; 3] = [0x00, 0xB1, 0x85];

/// CANSTAT polls before a mode change is declared failed.
const MODE_POLLS: u32 = 100;

/// Acceptance filters, in RXF0..RXF5 order.
pub const FILTERS: [u32; 6] = [
    ids::BMS_LIMITS,
    ids::BMS_LIMITS,
    ids::CHARGE_AH_RESPONSE,
    ids::DISCHARGE_AH_RESPONSE,
    ids::DISCHARGE_AH_RESPONSE,
    ids::DISCHARGE_AH_RESPONSE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mcp2515Error<E> {
    Spi(E),
    /// CANSTAT never reported the requested mode.
    ModeTimeout(u8),
    /// All three transmit buffers still pending.
    TxBusy,
}

impl<E> From<E> for Mcp2515Error<E> {
    fn from(e: E) -> Self {
        Self::Spi(e)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Identifier encoding
// ═══════════════════════════════════════════════════════════════

/// SIDH, SIDL, EID8, EID0 for an identifier.
pub fn encode_id(id: u32, extended: bool) -> [u8; 4] {
    if extended {
        let id = id & EXT_ID_MASK;
        [
            (id >> 21) as u8,
            (((id >> 13) & 0xE0) as u8) | SIDL_EXIDE | (((id >> 16) & 0x03) as u8),
            (id >> 8) as u8,
            id as u8,
        ]
    } else {
        let id = id & 0x7FF;
        [(id >> 3) as u8, ((id & 0x07) << 5) as u8, 0, 0]
    }
}

/// Inverse of [`encode_id`].  Returns `(id, extended)`.
pub fn decode_id(regs: [u8; 4]) -> (u32, bool) {
    let [sidh, sidl, eid8, eid0] = regs.map(u32::from);
    if sidl & u32::from(SIDL_EXIDE) != 0 {
        let id = (sidh << 21) | ((sidl & 0xE0) << 13) | ((sidl & 0x03) << 16) | (eid8 << 8) | eid0;
        (id, true)
    } else {
        ((sidh << 3) | (sidl >> 5), false)
    }
}

/// Parse the 13 bytes read by a READ RX BUFFER instruction.
pub fn parse_rx_buffer(raw: &[u8; 13]) -> CanFrame {
    let (id, extended) = decode_id([raw[0], raw[1], raw[2], raw[3]]);
    let len = usize::from(raw[4] & 0x0F).min(8);
    let data = &raw[5..5 + len];
    if extended {
        CanFrame::extended(id, data)
    } else {
        CanFrame::standard(id as u16, data)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Driver
// ═══════════════════════════════════════════════════════════════

pub struct Mcp2515<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> Mcp2515<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    /// Reset, program bit timing and filters, then enter normal mode.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<(), Mcp2515Error<SPI::Error>> {
        self.spi.write(&[INSTR_RESET])?;
        delay.delay_ms(5);
        self.set_mode(MODE_CONFIG)?;

        self.write_registers(REG_CNF3, &[CNF_250K_8MHZ[2], CNF_250K_8MHZ[1], CNF_250K_8MHZ[0]])?;

        for reg in REG_RXM {
            self.write_registers(reg, &encode_id(EXT_ID_MASK, true))?;
        }
        for (reg, id) in REG_RXF.into_iter().zip(FILTERS) {
            self.write_registers(reg, &encode_id(id, true))?;
        }
        self.write_registers(REG_RXB0CTRL, &[RXB0_BUKT])?;
        self.write_registers(REG_RXB1CTRL, &[0x00])?;
        self.write_registers(REG_CANINTE, &[INTE_RX0IE_RX1IE])?;

        self.set_mode(MODE_NORMAL)?;
        log::info!("MCP2515: 250 kbit/s, {} filters, normal mode", FILTERS.len());
        Ok(())
    }

    /// Queue a frame in the first free transmit buffer.
    pub fn transmit(&mut self, frame: &CanFrame) -> Result<(), Mcp2515Error<SPI::Error>> {
        let status = self.read_status()?;
        let Some(n) = (0..3).find(|&n| status & STATUS_TXREQ[n] == 0) else {
            return Err(Mcp2515Error::TxBusy);
        };

        let mut buf = [0u8; 14];
        buf[0] = INSTR_LOAD_TX[n];
        buf[1..5].copy_from_slice(&encode_id(frame.id(), frame.is_extended()));
        buf[5] = frame.dlc();
        let len = usize::from(frame.dlc());
        buf[6..6 + len].copy_from_slice(frame.data());
        self.spi.write(&buf[..6 + len])?;
        self.spi.write(&[INSTR_RTS[n]])?;
        Ok(())
    }

    /// Pop one received frame, if any.  Reading the buffer clears its
    /// interrupt flag.
    pub fn receive(&mut self) -> Result<Option<CanFrame>, Mcp2515Error<SPI::Error>> {
        let status = self.read_status()?;
        let instr = if status & STATUS_RX0IF != 0 {
            INSTR_READ_RX[0]
        } else if status & STATUS_RX1IF != 0 {
            INSTR_READ_RX[1]
        } else {
            return Ok(None);
        };
        let mut raw = [0u8; 13];
        self.spi
            .transaction(&mut [Operation::Write(&[instr]), Operation::Read(&mut raw)])?;
        Ok(Some(parse_rx_buffer(&raw)))
    }

    pub fn state(&mut self) -> Result<BusState, Mcp2515Error<SPI::Error>> {
        if self.read_register(REG_CANSTAT)? & MODE_MASK != MODE_NORMAL {
            return Ok(BusState::Stopped);
        }
        let eflg = self.read_register(REG_EFLG)?;
        Ok(if eflg & EFLG_TXBO != 0 {
            BusState::BusOff
        } else if eflg & (EFLG_TXEP | EFLG_RXEP) != 0 {
            BusState::Degraded
        } else {
            BusState::Running
        })
    }

    // ── Internal ──────────────────────────────────────────────────

    fn set_mode(&mut self, mode: u8) -> Result<(), Mcp2515Error<SPI::Error>> {
        self.spi
            .write(&[INSTR_BIT_MODIFY, REG_CANCTRL, MODE_MASK, mode])?;
        for _ in 0..MODE_POLLS {
            if self.read_register(REG_CANSTAT)? & MODE_MASK == mode {
                return Ok(());
            }
        }
        Err(Mcp2515Error::ModeTimeout(mode))
    }

    fn read_register(&mut self, reg: u8) -> Result<u8, SPI::Error> {
        let mut out = [0u8];
        self.spi
            .transaction(&mut [Operation::Write(&[INSTR_READ, reg]), Operation::Read(&mut out)])?;
        Ok(out[0])
    }

    fn write_registers(&mut self, start: u8, values: &[u8]) -> Result<(), SPI::Error> {
        let mut buf = [0u8; 16];
        let len = values.len().min(14);
        buf[0] = INSTR_WRITE;
        buf[1] = start;
        buf[2..2 + len].copy_from_slice(&values[..len]);
        self.spi.write(&buf[..2 + len])
    }

    fn read_status(&mut self) -> Result<u8, SPI::Error> {
        let mut out = [0u8];
        self.spi
            .transaction(&mut [Operation::Write(&[INSTR_READ_STATUS]), Operation::Read(&mut out)])?;
        Ok(out[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::spi::ErrorType;
    use std::collections::VecDeque;

    /// Records every write; answers reads from a script.
    #[derive(Default)]
    struct FakeSpi {
        writes: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl ErrorType for FakeSpi {
        type Error = Infallible;
    }

    impl SpiDevice for FakeSpi {
        fn transaction(&mut self, ops: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            for op in ops {
                match op {
                    Operation::Write(w) => self.writes.push(w.to_vec()),
                    Operation::Read(r) => {
                        let reply = self.replies.pop_front().unwrap_or_default();
                        for (dst, src) in r.iter_mut().zip(reply) {
                            *dst = src;
                        }
                    }
                    Operation::Transfer(r, w) => {
                        self.writes.push(w.to_vec());
                        r.fill(0);
                    }
                    Operation::TransferInPlace(b) => {
                        self.writes.push(b.to_vec());
                        b.fill(0);
                    }
                    Operation::DelayNs(_) => {}
                }
            }
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn extended_id_roundtrip_known_values() {
        let regs = encode_id(ids::BMS_LIMITS, true);
        // 0x1806E5F4: SIDH = bits 28..21, SIDL = 20..18 | EXIDE | 17..16
        assert_eq!(regs, [0xC0, 0x2A, 0xE5, 0xF4]);
        assert_eq!(decode_id(regs), (ids::BMS_LIMITS, true));
        assert_eq!(decode_id(encode_id(0x123, false)), (0x123, false));
    }

    #[test]
    fn rx_buffer_parses_dlc_and_payload() {
        let mut raw = [0u8; 13];
        raw[..4].copy_from_slice(&encode_id(ids::CHARGE_AH_RESPONSE, true));
        raw[4] = 0x04;
        raw[5..9].copy_from_slice(&[1, 2, 3, 4]);
        let f = parse_rx_buffer(&raw);
        assert_eq!(f.id(), ids::CHARGE_AH_RESPONSE);
        assert!(f.is_extended());
        assert_eq!(f.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn init_programs_timing_and_filters() {
        let mut spi = FakeSpi::default();
        // CANSTAT reads: config mode reached, then normal mode reached.
        spi.replies.push_back(vec![MODE_CONFIG]);
        spi.replies.push_back(vec![MODE_NORMAL]);
        let mut dev = Mcp2515::new(spi);
        dev.init(&mut NoDelay).unwrap();

        let writes = &dev.spi.writes;
        assert_eq!(writes[0], vec![INSTR_RESET]);
        assert!(writes.contains(&vec![INSTR_WRITE, REG_CNF3, 0x85, 0xB1, 0x00]));
        let mut rxf0 = vec![INSTR_WRITE, REG_RXF[0]];
        rxf0.extend_from_slice(&encode_id(ids::BMS_LIMITS, true));
        assert!(writes.contains(&rxf0));
        assert_eq!(
            writes.last().unwrap(),
            &vec![INSTR_READ, REG_CANSTAT],
        );
    }

    #[test]
    fn mode_timeout_is_reported() {
        let spi = FakeSpi::default();
        let mut dev = Mcp2515::new(spi);
        // CANSTAT always reads 0x00 (normal) so config mode never lands.
        assert_eq!(dev.init(&mut NoDelay), Err(Mcp2515Error::ModeTimeout(MODE_CONFIG)));
    }

    #[test]
    fn transmit_picks_first_free_buffer() {
        let mut spi = FakeSpi::default();
        // TXB0 busy, TXB1 free.
        spi.replies.push_back(vec![STATUS_TXREQ[0]]);
        let mut dev = Mcp2515::new(spi);
        let frame = CanFrame::extended(ids::CHARGER_FEEDBACK, &[1, 2, 3, 4, 5, 6, 7, 8]);
        dev.transmit(&frame).unwrap();

        let writes = &dev.spi.writes;
        let load = &writes[writes.len() - 2];
        assert_eq!(load[0], INSTR_LOAD_TX[1]);
        assert_eq!(load[5], 8);
        assert_eq!(&load[6..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(writes.last().unwrap(), &vec![INSTR_RTS[1]]);
    }

    #[test]
    fn all_buffers_busy() {
        let mut spi = FakeSpi::default();
        spi.replies.push_back(vec![0x54]);
        let mut dev = Mcp2515::new(spi);
        let frame = CanFrame::extended(0x100, &[]);
        assert_eq!(dev.transmit(&frame), Err(Mcp2515Error::TxBusy));
    }

    #[test]
    fn bus_off_flag_maps_to_state() {
        let mut spi = FakeSpi::default();
        spi.replies.push_back(vec![MODE_NORMAL]);
        spi.replies.push_back(vec![EFLG_TXBO]);
        let mut dev = Mcp2515::new(spi);
        assert_eq!(dev.state().unwrap(), BusState::BusOff);
    }
}
