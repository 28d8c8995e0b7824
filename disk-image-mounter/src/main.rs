// SPDX-License-Identifier: GPL-3.0-only

//! Attach and detach disk image files as UDisks2 loop devices.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use storage_quiesce::{QuiesceError, ensure_unused};
use storage_udisks::{UdisksBackend, block_object_path_for_device, loop_delete, loop_setup};

#[derive(Debug, Parser)]
#[command(name = "disk-image-mounter")]
#[command(about = "Attach and mount one or more disk image files")]
struct MounterCli {
    #[command(subcommand)]
    command: MounterCommand,
}

#[derive(Debug, Subcommand)]
enum MounterCommand {
    /// Set up a loop device for each image. Mounting and unlocking of
    /// whatever appears inside the image is left to the desktop
    /// automounter.
    Attach {
        /// Image files to attach
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Allow writing to the image
        #[arg(short = 'w', long)]
        writable: bool,
    },

    /// Tear down previously attached loop devices, unmounting and
    /// locking anything still active inside them first.
    Detach {
        /// Loop devices to detach (e.g. /dev/loop0)
        #[arg(required = true)]
        devices: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("disk_image_mounter=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = MounterCli::parse();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match cli.command {
        MounterCommand::Attach { images, writable } => attach(&images, writable).await,
        MounterCommand::Detach { devices } => detach(&devices, &cancel).await,
    }
}

async fn attach(images: &[PathBuf], writable: bool) -> ExitCode {
    let connection = match zbus::Connection::system().await {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("Error connecting to the UDisks2 daemon: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    for image in images {
        match loop_setup(&connection, image, writable).await {
            Ok(device) => println!("Attached {} at {}", image.display(), device.as_str()),
            Err(err) => {
                eprintln!("Error attaching disk image {}: {err:#}", image.display());
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn detach(devices: &[String], cancel: &CancellationToken) -> ExitCode {
    let backend = match UdisksBackend::new().await {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("Error connecting to the UDisks2 daemon: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    for device in devices {
        match detach_one(&backend, device, cancel).await {
            Ok(()) => println!("Detached {device}"),
            Err(err) => {
                failed = true;
                // Stay quiet about aborts the user asked for.
                let cancelled = err
                    .downcast_ref::<QuiesceError>()
                    .is_some_and(QuiesceError::is_cancelled);
                if !cancelled {
                    eprintln!("Error detaching {device}: {err:#}");
                }
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn detach_one(
    backend: &UdisksBackend,
    device: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let object = block_object_path_for_device(backend.connection(), device).await?;
    ensure_unused(backend, &object, cancel).await?;
    loop_delete(backend.connection(), &object).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        MounterCli::command().debug_assert();
    }

    #[test]
    fn attach_defaults_to_read_only() {
        let cli =
            MounterCli::try_parse_from(["disk-image-mounter", "attach", "image.iso"]).unwrap();
        match cli.command {
            MounterCommand::Attach { images, writable } => {
                assert_eq!(images, vec![PathBuf::from("image.iso")]);
                assert!(!writable);
            }
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn short_writable_flag_is_accepted() {
        let cli = MounterCli::try_parse_from([
            "disk-image-mounter",
            "attach",
            "-w",
            "a.img",
            "b.img",
        ])
        .unwrap();
        match cli.command {
            MounterCommand::Attach { images, writable } => {
                assert_eq!(images.len(), 2);
                assert!(writable);
            }
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn attach_requires_at_least_one_image() {
        assert!(MounterCli::try_parse_from(["disk-image-mounter", "attach"]).is_err());
    }
}
