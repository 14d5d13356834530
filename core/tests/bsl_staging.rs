//! Full BSL bring-up against a scripted endpoint: BROM handshake, FDL1
//! and FDL2 staging, transcode disable and partition-table read.

use cinder::bsl::hdlc::FrameEncoder;
use cinder::bsl::{BslState, profile};
use cinder::session::Session;
use cinder::transport::mock::MockTransport;
use cinder::{CancelToken, ProgressBus, Timeouts};

const ACK: u8 = 0x80;
const VER: u8 = 0x81;
const PARTITION: u8 = 0xBA;

fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    FrameEncoder::new().encode(cmd, payload).unwrap()
}

fn utf16_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(72);
    for unit in name.encode_utf16().take(36) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.resize(72, 0);
    out
}

#[tokio::test]
async fn brom_to_fdl2_bringup() {
    // FDL1 is two BROM-sized chunks (0x840); FDL2 fits one FDL chunk.
    let fdl1 = vec![0x11u8; 0x1000];
    let fdl2 = vec![0x22u8; 0x1000];

    let mut table_payload = Vec::new();
    for (name, sectors) in [("boot", 0x2000u32), ("system", 0x100000)] {
        table_payload.extend_from_slice(&utf16_name(name));
        table_payload.extend_from_slice(&sectors.to_le_bytes());
    }

    let mock = MockTransport::new()
        .loose()
        // BROM probe burst, then CONNECT
        .reply(&frame(VER, b"SPRD3\0"))
        .reply(&frame(ACK, &[]))
        // FDL1: START, two MIDST chunks, END, EXEC
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        // FDL1 greets like a fresh endpoint
        .reply(&frame(VER, b"Spreadtrum Boot Block\0"))
        .reply(&frame(ACK, &[]))
        // FDL2: START, one MIDST chunk, END, EXEC
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        // FDL2 handshake, then DISABLE_TRANSCODE
        .reply(&frame(VER, b"FDL2\0"))
        .reply(&frame(ACK, &[]))
        .reply(&frame(ACK, &[]))
        // partition table
        .reply(&frame(PARTITION, &table_payload));

    let chip = profile("sc9863a").unwrap();
    let session = Session::connect_bsl(
        Box::new(mock),
        chip,
        &fdl1,
        &fdl2,
        Timeouts::default(),
        CancelToken::new(),
        &ProgressBus::sink(),
    )
    .await
    .unwrap();

    let Session::Bsl(bsl) = session else {
        panic!("expected a BSL session");
    };

    assert_eq!(bsl.client.state(), BslState::Fdl2);
    assert_eq!(bsl.table.len(), 2);

    let system = bsl.table.find("system").unwrap();
    assert_eq!(system.num_sectors, 0x100000);
    // Entries are laid out back to back from sector 0.
    assert_eq!(system.start_sector, 0x2000);
}
