//! Send a handful of frames through an in-process fabric and print what
//! the responder receives.
//!
//! ```text
//! RUST_LOG=slotline=debug cargo run -p slotline --example loopback_ping
//! ```

use slotline::{
    BufferPool, FrameHeader, LoopbackFabric, Message, Originator, Responder, SlotlineConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const PORT: u16 = 9000;
const SLOT_SIZE: usize = 1024;
const COUNT: i32 = 10;

fn main() -> slotline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SlotlineConfig::from_env();
    let fabric = LoopbackFabric::new();

    let seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&seen);
    let responder = Responder::new(fabric.clone(), &config, move |msg| {
        let header = msg.header();
        println!(
            "recv seq={} from node {}: {}",
            header.seq,
            header.send_node_id,
            String::from_utf8_lossy(msg.payload())
        );
        counter.fetch_add(1, Ordering::Relaxed);
    })?;
    let listener = responder.listen_default(PORT, SLOT_SIZE)?;

    let originator = Originator::new(fabric, &config)?;
    let pool = BufferPool::new(SLOT_SIZE, 64)?;
    let dest = originator.connect("localhost", PORT, &pool)?;
    responder.accept(listener)?;

    for seq in 0..COUNT {
        let Some(slot) = pool.acquire() else {
            break;
        };
        let mut msg = Message::from_slot(slot)?;
        msg.set_header(&FrameHeader {
            send_node_id: 1,
            recv_node_id: 2,
            seq,
            ..Default::default()
        })?;
        msg.write_payload(format!("ping #{seq}").as_bytes())?;
        originator.send(Arc::new(msg), dest)?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.load(Ordering::Relaxed) < COUNT as u64 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    originator.stop()?;
    responder.stop()?;
    println!("{:?}", originator.stats());
    Ok(())
}
