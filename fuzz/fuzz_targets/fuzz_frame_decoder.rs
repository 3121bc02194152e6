//! Fuzz target: `Decoder::decode` and `Telemetry::apply`
//!
//! Splits the input into (id, bus, payload) records and drives each one
//! through both current scales and into a telemetry store.  Asserts the
//! decoder never panics and that applied readings never produce an
//! out-of-range SOC.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use evse_controller::can::{BusId, CanFrame};
use evse_controller::config::ChargerCurrentScale;
use evse_controller::protocol::Decoder;
use evse_controller::soc::CapacityTiers;
use evse_controller::telemetry::Telemetry;
use libfuzzer_sys::fuzz_target;

/// id (4) + bus/len (1) + payload (8)
const RECORD: usize = 13;

fuzz_target!(|data: &[u8]| {
    let tiers = CapacityTiers::default();
    let decoders = [
        Decoder::new(ChargerCurrentScale::Deci),
        Decoder::new(ChargerCurrentScale::Fixed1024),
    ];
    let mut telemetry = Telemetry::new();

    for (n, rec) in data.chunks_exact(RECORD).enumerate() {
        let id = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
        let bus = if rec[4] & 0x80 == 0 { BusId::Charger } else { BusId::Bms };
        let len = usize::from(rec[4] & 0x0F).min(8);
        let frame = CanFrame::extended(id, &rec[5..5 + len]);
        assert!(frame.data().len() <= 8);

        for decoder in &decoders {
            if let Ok(decoded) = decoder.decode(bus, &frame) {
                let applied = telemetry.apply(&decoded, n as u64, &tiers);
                if let Some(soc) = applied.soc {
                    assert!((0.0..=100.0).contains(&soc.percent), "SOC {}", soc.percent);
                }
            }
        }
    }
});
