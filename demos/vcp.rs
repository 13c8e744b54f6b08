use std::env::args;
use std::sync::Arc;
use ddc_exchange::{check_displays, Config, Context, DisplayHandle, DisplayPath, DisplayRef, FileStore, LinuxI2cOpener};

fn main() {
    let buses: Vec<u32> = args().skip(1)
        .map(|arg| arg.parse().expect("argument: i2c bus numbers"))
        .collect();

    let context = Context::new(Config::default()).expect("invalid configuration");
    let context = match FileStore::open_default() {
        Ok(store) => context.with_store(Arc::new(store)),
        Err(e) => {
            println!("not persisting sleep adjustments: {}", e);
            context
        },
    };

    let opener = LinuxI2cOpener;
    let displays: Vec<_> = buses.iter()
        .filter_map(|&bus| match DisplayRef::detect(DisplayPath::i2c(bus), &opener) {
            Ok(display) => Some(Arc::new(display)),
            Err(e) => {
                println!("/dev/i2c-{}: {}", bus, e);
                None
            },
        }).collect();

    for display in check_displays(&context, &displays, &opener) {
        println!("{}", display);
        let mut handle = DisplayHandle::open(&context, display, &opener).expect("failed to open display");

        match handle.capabilities_string() {
            Ok(caps) => println!("  capabilities: {}", String::from_utf8_lossy(&caps)),
            Err(e) => println!("  capabilities: {}", e),
        }

        match handle.get_vcp_feature(0x10) {
            Ok(value) => println!("  brightness: {} / {}", value.value(), value.maximum()),
            Err(e) => println!("  brightness: {}", e),
        }

        handle.close().expect("failed to close display");
    }

    for summary in context.registry().summaries() {
        println!("{}: sleep factor {:.2}", summary.path, summary.sleep.adjustment_factor);
    }
}
