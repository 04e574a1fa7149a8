// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Host demo binary for the waggle bus: stands a subsystem up, opens a pair
//! of connections, and runs a ping/pong exchange plus a sealed-memory
//! transfer so the data paths can be watched under `RUST_LOG=debug`.

use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use waggle_bus::{
    AttachMask, BusSpec, NameFlags, NameListFilter, ProcessContext, Subsystem,
};
use waggle_wire::{MessageBuilder, MSG_FLAG_EXPECT_REPLY};

/// Waggle bus demo command-line arguments.
#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Waggle bus loopback demo", long_about = None)]
struct Cli {
    /// Bus name to create in the root domain.
    #[arg(long, default_value = "demo")]
    bus: String,

    /// Receive pool size in bytes for each connection.
    #[arg(long, default_value_t = 64 * 1024)]
    pool_size: u64,

    /// Number of ping messages to exchange.
    #[arg(long, default_value_t = 8)]
    count: u64,

    /// Size of the sealed-memory payload in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    memfd_size: u64,

    /// Print the name registry snapshot as JSON before exiting.
    #[arg(long)]
    list_names: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let subsystem = Subsystem::new();
    let mut control = subsystem.open_control().context("open control")?;
    let bus = control
        .make_bus(BusSpec::new(cli.bus.as_str()))
        .context("make bus")?;
    let endpoint = bus.default_endpoint().context("default endpoint")?;

    let server = endpoint
        .open(ProcessContext::new(1000, 1000, 100).with_exe("/usr/bin/waggled"))
        .context("open server connection")?;
    let server_id = server.hello(cli.pool_size, AttachMask::TIMESTAMP | AttachMask::CREDS)?;
    server.request_name("org.waggle.demo", NameFlags::NONE)?;
    info!("server connection {server_id} owns org.waggle.demo");

    let client = endpoint
        .open(ProcessContext::new(1000, 1000, 101))
        .context("open client connection")?;
    let client_id = client.hello(cli.pool_size, AttachMask::TIMESTAMP)?;
    info!("client connection {client_id} active");

    let count = cli.count;
    let echo = thread::spawn(move || -> Result<u64, waggle_bus::BusError> {
        let mut served = 0;
        for _ in 0..count {
            let inbound = server.recv()?;
            let message = server.read_message(inbound.offset)?;
            let payload = message.inline_payload().unwrap_or_default().to_vec();
            server.free(inbound.offset)?;
            let reply = MessageBuilder::unicast(inbound.src_id)
                .cookie(inbound.cookie)
                .reply_to(inbound.cookie)
                .inline(&payload)
                .encode()?;
            server.send(&reply)?;
            served += 1;
        }
        Ok(served)
    });

    for cookie in 1..=count {
        let ping = MessageBuilder::to_name("org.waggle.demo")
            .cookie(cookie)
            .expect_reply(1_000_000_000)
            .inline(format!("ping {cookie}").as_bytes())
            .encode()
            .context("encode ping")?;
        client.send(&ping).context("send ping")?;
        let pong = client.recv().context("recv pong")?;
        let message = client.read_message(pong.offset)?;
        assert_eq!(message.flags & MSG_FLAG_EXPECT_REPLY, 0);
        info!(
            "pong {} from {}: {}",
            pong.cookie,
            pong.src_id,
            String::from_utf8_lossy(message.inline_payload().unwrap_or_default())
        );
        client.free(pong.offset)?;
    }
    let served = echo.join().expect("echo thread")?;
    info!("echo thread served {served} replies");

    // Zero-copy path: seal a payload and hand B a reference, not a copy.
    let memfd = subsystem.memfd_new(cli.memfd_size.max(64)).context("memfd new")?;
    memfd.write(0, b"sealed payload header")?;
    memfd.seal();
    let peer = endpoint.open(ProcessContext::new(1000, 1000, 102))?;
    peer.hello(cli.pool_size, AttachMask::NONE)?;
    let carrier = MessageBuilder::unicast(peer.id())
        .cookie(count + 1)
        .memfd(memfd.id(), memfd.size())
        .encode()?;
    client.send(&carrier)?;
    let delivery = peer.recv()?;
    let attachment = delivery.memfds.first().context("memfd attachment")?;
    let view = attachment.map_readonly()?;
    info!(
        "sealed transfer: {} bytes shared, starts {:?}",
        view.len(),
        &view.as_slice()[..21]
    );
    peer.free(delivery.offset)?;

    if cli.list_names {
        let names = client.list_names(&NameListFilter::All)?;
        println!("{}", serde_json::to_string_pretty(&names)?);
    }

    control.close();
    subsystem.shutdown();
    Ok(())
}
