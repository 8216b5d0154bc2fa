//! `schsm-tool`: administrative card operations.
//!
//! PIN management, device initialisation, key wrap/unwrap and bulk
//! save/restore of elementary files. Thin wrappers over the card command
//! set; status words are printed rather than interpreted.
//!
//! Like `schsm-signer`, the binary drives the bundled card simulation (the
//! platform reader backend is a separate crate). State does not persist
//! between invocations; the tool documents and exercises the command flows.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use schsm::apdu::MAX_TRANSPORT_PAYLOAD;
use schsm::card::{HsmChannel, Pin, EF_DEV_AUT};
use schsm::mock::{MockHsm, DEFAULT_SO_PIN};
use schsm::reader::CardConnection;

#[derive(Parser, Debug)]
#[command(name = "schsm-tool", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the user PIN status word.
    PinStatus,
    /// Write the object directory and all readable files to disk.
    SaveFiles {
        #[arg(long)]
        pin: Option<String>,
    },
    /// Restore elementary files saved as XXXX.asn.
    RestoreFiles {
        pin: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Initialise the device with a fresh user PIN.
    InitToken {
        pin: String,
        /// 16 hex digits; defaults to the transport key.
        so_pin: Option<String>,
        /// File holding concatenated 32-byte DKEK shares.
        #[arg(long)]
        dkek_file: Option<PathBuf>,
    },
    /// Reset the PIN retry counter with the SO-PIN.
    UnlockPin { so_pin: String },
    /// Set a new user PIN with the SO-PIN.
    SetPin {
        pin: String,
        so_pin: Option<String>,
    },
    /// Change the user PIN.
    ChangePin { old_pin: String, new_pin: String },
    /// Change the SO-PIN.
    ChangeSoPin { old_so_pin: String, new_so_pin: String },
    /// Export a key wrapped under the device encryption key.
    WrapKey {
        pin: String,
        key_id: u8,
        file: PathBuf,
    },
    /// Import a wrapped key.
    UnwrapKey {
        pin: String,
        key_id: u8,
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprint!("{e}");
            return ExitCode::from(1);
        }
    };

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tool failed");
            ExitCode::from(2)
        }
    }
}

/// Connect to the first reader hosting the HSM application and optionally
/// verify the user PIN.
fn open_card(hsm: &MockHsm, pin: Option<&str>) -> Result<Box<dyn CardConnection>, Box<dyn std::error::Error>> {
    let transport = hsm.transport();
    for reader in transport.list_readers()? {
        let Ok(mut connection) = transport.connect(&reader) else {
            continue;
        };
        let mut channel = HsmChannel::new(connection.as_mut());
        if channel.select_app().is_err() {
            continue;
        }
        if let Some(pin) = pin {
            channel.verify_user_pin(&Pin::user(pin)?)?;
        }
        return Ok(connection);
    }
    Err("no card found".into())
}

fn so_pin_or_default(so_pin: Option<&str>) -> Result<Pin, schsm::CkError> {
    Pin::security_officer(so_pin.unwrap_or(DEFAULT_SO_PIN))
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let hsm = MockHsm::builder().reader("simulated reader").build();
    let mut connection = match &command {
        Command::PinStatus
        | Command::InitToken { .. }
        | Command::UnlockPin { .. }
        | Command::SetPin { .. }
        | Command::ChangePin { .. }
        | Command::ChangeSoPin { .. } => open_card(&hsm, None)?,
        Command::SaveFiles { pin } => open_card(&hsm, pin.as_deref())?,
        Command::RestoreFiles { pin, .. }
        | Command::WrapKey { pin, .. }
        | Command::UnwrapKey { pin, .. } => open_card(&hsm, Some(pin))?,
    };
    let mut channel = HsmChannel::new(connection.as_mut());

    match command {
        Command::PinStatus => {
            let sw = channel.pin_status()?;
            println!("pin status: 0x{sw}");
        }
        Command::SaveFiles { .. } => {
            let directory = channel.enumerate_objects()?;
            let mut dir_bytes = Vec::new();
            for (family, name) in &directory {
                dir_bytes.push(*family);
                dir_bytes.push(*name);
            }
            println!("write 'dir.hsm'");
            std::fs::write("dir.hsm", &dir_bytes)?;
            for (family, name) in directory {
                if family == schsm::card::FAMILY_PRIVATE_KEY {
                    // never readable
                    continue;
                }
                let fid = u16::from(family) << 8 | u16::from(name);
                let mut content = Vec::new();
                loop {
                    let chunk = channel.read_file(fid, content.len() as u16, MAX_TRANSPORT_PAYLOAD)?;
                    let done = chunk.len() < MAX_TRANSPORT_PAYLOAD;
                    content.extend_from_slice(&chunk);
                    if done {
                        break;
                    }
                }
                let name = format!("{fid:04X}.asn");
                println!("write '{name}'");
                std::fs::write(name, content)?;
            }
        }
        Command::RestoreFiles { files, .. } => {
            for path in files {
                // file names must be exactly four hex digits plus .asn
                let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
                let fid = name
                    .strip_suffix(".asn")
                    .filter(|s| s.len() == 4 && s.bytes().all(|b| b.is_ascii_hexdigit()))
                    .and_then(|s| u16::from_str_radix(s, 16).ok());
                let Some(fid) = fid else {
                    println!(
                        "filename '{}' must be 'abcd.asn' where abcd is a valid hex number",
                        path.display()
                    );
                    continue;
                };
                if fid == EF_DEV_AUT {
                    println!("filename '{name}' skipped, EF_DevAut is readonly");
                    continue;
                }
                let content = match std::fs::read(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        println!("cant read file '{}': {e}", path.display());
                        continue;
                    }
                };
                if content.is_empty() {
                    println!("file '{}' empty", path.display());
                    continue;
                }
                let mut off = 0usize;
                let mut write_error = None;
                while off < content.len() {
                    let chunk = (content.len() - off).min(MAX_TRANSPORT_PAYLOAD - 6);
                    if let Err(e) = channel.write_file(fid, off as u16, &content[off..off + chunk]) {
                        write_error = Some(e);
                        break;
                    }
                    off += chunk;
                }
                match write_error {
                    Some(e) => println!("write error ({e}) file '{name}'"),
                    None => println!("file '{name}' successfully restored"),
                }
            }
        }
        Command::InitToken { pin, so_pin, dkek_file } => {
            let shares = match dkek_file {
                Some(path) => read_dkek_shares(&path)?,
                None => Vec::new(),
            };
            let statuses = channel.initialize_device(
                &Pin::user(&pin)?,
                &so_pin_or_default(so_pin.as_deref())?,
                &shares,
            )?;
            for s in statuses {
                println!(
                    "total shares: {}, outstanding shares: {}, key check value: {}",
                    s.total_shares,
                    s.outstanding_shares,
                    hex::encode(s.key_check_value)
                );
            }
            println!("token initialised");
        }
        Command::UnlockPin { so_pin } => {
            channel.unlock_pin(&Pin::security_officer(&so_pin)?)?;
            println!("pin unlocked");
        }
        Command::SetPin { pin, so_pin } => {
            channel.set_pin(&so_pin_or_default(so_pin.as_deref())?, &Pin::user(&pin)?)?;
            println!("pin set");
        }
        Command::ChangePin { old_pin, new_pin } => {
            channel.change_pin(&Pin::user(&old_pin)?, &Pin::user(&new_pin)?)?;
            println!("pin changed");
        }
        Command::ChangeSoPin { old_so_pin, new_so_pin } => {
            channel.change_so_pin(
                &Pin::security_officer(&old_so_pin)?,
                &Pin::security_officer(&new_so_pin)?,
            )?;
            println!("so-pin changed");
        }
        Command::WrapKey { key_id, file, .. } => {
            let wrapped = channel.wrap_key(key_id)?;
            std::fs::write(&file, &wrapped)?;
            println!("wrote {} bytes to '{}'", wrapped.len(), file.display());
        }
        Command::UnwrapKey { key_id, file, .. } => {
            let wrapped = std::fs::read(&file)?;
            channel.unwrap_key(key_id, &wrapped)?;
            println!("key {key_id} restored");
        }
    }
    Ok(())
}

fn read_dkek_shares(path: &PathBuf) -> Result<Vec<[u8; 32]>, Box<dyn std::error::Error>> {
    let raw = std::fs::read(path)?;
    if raw.is_empty() || raw.len() % 32 != 0 {
        return Err("DKEK share file must hold 32-byte shares".into());
    }
    Ok(raw
        .chunks_exact(32)
        .map(|c| {
            let mut share = [0u8; 32];
            share.copy_from_slice(c);
            share
        })
        .collect())
}
