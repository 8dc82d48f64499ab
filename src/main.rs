use anyhow::Context;
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait};
use speak_stream::{load_config, CpalSink, SpeechClient, SpeechHandle, StreamMode};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "speak-stream")]
#[command(about = "Speaks each line read from stdin through a streaming TTS endpoint")]
#[command(long_about = "
Reads text from stdin, one utterance per line, and plays the synthesized speech in
the order the lines were entered. The endpoint is configured through SPEAK_* environment
variables (a .env file is honoured).

EXAMPLES:
  # Speak a single line
  echo \"Good move.\" | speak-stream

  # Interactive, chunked streaming with a specific voice
  speak-stream --voice narrator --mode chunks
")]
struct Args {
    /// Voice identifier sent with every request (overrides SPEAK_VOICE_ID)
    #[arg(long)]
    voice: Option<String>,

    /// Streaming mode, chunks or parts (overrides SPEAK_STREAM_MODE)
    #[arg(long)]
    mode: Option<StreamMode>,

    /// Output device name for audio playback
    #[arg(long)]
    output_device: Option<String>,

    /// List available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        return list_output_devices();
    }

    let mut config = load_config()?;
    if args.voice.is_some() {
        config.voice_id = args.voice;
    }
    if args.mode.is_some() {
        config.stream_mode = args.mode;
    }
    if args.output_device.is_some() {
        config.audio.device_name = args.output_device;
    }

    let sink = Arc::new(CpalSink::new(config.audio.clone()).context("Audio sink failed")?);
    let client = SpeechClient::from_config(&config, sink)?;

    let mut status = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            println!("[{}]", event.status());
        }
    });

    client.connect().await.context("Failed to connect")?;
    println!("Type a line and press Enter to hear it. Ctrl+C exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Vec<SpeechHandle> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received, shutting down");
                client.reset();
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match client.speak(line.trim()) {
                    Ok(handle) => pending.push(handle),
                    Err(e) => log::error!("Failed to speak: {}", e),
                },
                None => {
                    // Let everything already typed finish playing.
                    for handle in pending.drain(..) {
                        if let Err(e) = handle.finished().await {
                            log::warn!("Utterance failed: {}", e);
                        }
                    }
                    tokio::select! {
                        _ = client.wait_idle() => {}
                        _ = tokio::signal::ctrl_c() => client.reset(),
                    }
                    break;
                }
            },
        }
    }

    client.shutdown().await?;
    Ok(())
}

fn list_output_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    println!("Audio host: {:?}", host.id());
    let default_name = host
        .default_output_device()
        .and_then(|device| device.name().ok());

    for device in host.output_devices()? {
        let name = device.name()?;
        let marker = if Some(&name) == default_name.as_ref() {
            " (default)"
        } else {
            ""
        };
        match device.default_output_config() {
            Ok(config) => println!(
                "  {}{}: {} Hz, {} channels",
                name,
                marker,
                config.sample_rate().0,
                config.channels()
            ),
            Err(_) => println!("  {}{}", name, marker),
        }
    }
    Ok(())
}
