use anyhow::{Context, Result};
use std::net::{Ipv4Addr, UdpSocket};

use crate::cli::{BITS_PER_BYTE, Pacing, SendOpts};
use crate::command::{CommandRecord, RECORD_LEN};

pub fn run(opts: SendOpts) -> Result<()> {
    let pacing = Pacing::from_cli(&opts.gap, opts.util)?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("binding send socket")?;
    let record = CommandRecord::new(opts.code, opts.param);

    log::info!(
        "sending {} to {} count={} gap={}",
        record,
        opts.to,
        opts.count,
        opts.gap
    );

    let mut sent: u64 = 0;
    while opts.count == 0 || sent < opts.count {
        socket
            .send_to(&record.to_bytes(), opts.to)
            .with_context(|| format!("send to {}", opts.to))?;
        sent += 1;
        log::debug!("sent #{} {}", sent, record);

        if opts.count != 0 && sent >= opts.count {
            break;
        }
        if let Some(sleep) = pacing.sleep_for(RECORD_LEN, BITS_PER_BYTE, opts.baud) {
            std::thread::sleep(sleep);
        }
    }

    log::info!("sent {} datagram(s)", sent);
    Ok(())
}
