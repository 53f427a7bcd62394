//! Usage: `send_files <address> <file>...`
//!
//! Sends the files to a device over OBEX Object Push.

use std::{env, path::PathBuf, pin::pin, process};

use bluedeck::{
    obex::{BatchState, FileBatch, ObexManager},
    Session,
};
use futures_util::future::{select, Either};

#[pollster::main]
async fn main() -> bluedeck::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let mut args = env::args().skip(1);
    let Some(address) = args.next() else {
        eprintln!("usage: send_files <address> <file>...");
        process::exit(1);
    };
    let files: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let session = Session::new().await?;
    let obex = ObexManager::new(session);
    obex.subscribe(|event| {
        if let Some(fraction) = event.fraction() {
            log::info!("{}: {:.0}%", event.path(), fraction * 100.0);
        }
    });

    let mut batch = FileBatch::open(&obex, &address, files).await?;
    batch.start().await;

    let state = {
        let sending = pin!(batch.wait());
        match select(sending, pin!(obex.run())).await {
            Either::Left((state, _)) => state.clone(),
            Either::Right((res, _)) => {
                res?;
                return Ok(());
            }
        }
    };

    match state {
        BatchState::Failed { index, reason } => {
            log::error!("file #{} could not be sent: {}", index + 1, reason);
            batch.cancel().await;
            process::exit(1);
        }
        state => log::info!("{:?}, {} files sent", state, batch.sent()),
    }
    Ok(())
}
