use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;

use callcore::calls::sdp::SessionDescription;
use callcore::calls::{ConferenceDescription, GenerateSdpOptions, InitialSetup, MediaKind};

// Prints the compact setup a call would send for a local SDP, and optionally
// the remote SDP the peer would rebuild from it.
//
// Usage:
//   cargo run --bin sdp_inspect -- offer.sdp
//   cargo run --bin sdp_inspect -- offer.sdp --pretty --regenerate
//   cargo run --bin sdp_inspect -- offer.sdp --screencast-mid 2

#[derive(Parser, Debug)]
#[command(name = "sdp_inspect", about = "Inspect the call setup carried by an SDP")]
struct Args {
    /// SDP file to read
    sdp: PathBuf,

    /// Pretty-print the setup JSON
    #[arg(long)]
    pretty: bool,

    /// Also print the SDP rebuilt from the setup
    #[arg(long)]
    regenerate: bool,

    /// Video mids carrying a screencast rather than the camera
    #[arg(long = "screencast-mid")]
    screencast_mids: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.sdp)
        .with_context(|| format!("reading {}", args.sdp.display()))?;
    let sdp = SessionDescription::parse(&raw).context("parsing SDP")?;
    info!(
        "Session {} with {} media sections",
        sdp.session_id,
        sdp.media.len()
    );

    let setup = InitialSetup::from_sdp(&sdp, |mid| {
        args.screencast_mids
            .iter()
            .any(|m| m == mid)
            .then_some(MediaKind::Screencast)
    })
    .context("extracting setup")?;
    if setup.audio.is_none() && setup.video.is_none() && setup.screencast.is_none() {
        bail!("the SDP announces no sending media");
    }

    let json = if args.pretty {
        serde_json::to_string_pretty(&setup)?
    } else {
        serde_json::to_string(&setup)?
    };
    println!("{}", json);

    if args.regenerate {
        let mut description = ConferenceDescription::new(sdp.session_id.clone());
        description.apply_remote_setup(&setup)?;
        debug!("Rebuilt {} entries", description.entries().len());
        let regenerated = description.generate_sdp(&GenerateSdpOptions {
            bundle: description.mids(),
            is_answer: false,
        })?;
        println!();
        print!("{}", regenerated);
    }
    Ok(())
}
