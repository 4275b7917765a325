//! FoilPics - CLI
//!
//! Command-line access to the vault engine: one intent per invocation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use foilpics::{EngineConfig, FoilState, PicsEngine};

const WAIT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "foilpics")]
#[command(version = foilpics::VERSION)]
#[command(about = "Encrypted picture vault")]
struct Cli {
    /// Vault directory (encrypted pictures and the order file)
    #[arg(long)]
    vault: Option<PathBuf>,

    /// Key directory (holds foil.key)
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Thumbnail edge in pixels
    #[arg(long)]
    thumb_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the vault state
    Status,

    /// Generate a new key pair
    Generate {
        /// RSA modulus size
        #[arg(long, default_value_t = 2048)]
        bits: usize,

        /// Passphrase protecting the new key
        #[arg(short, long)]
        passphrase: String,
    },

    /// Import pictures into the vault (consumes the sources!)
    Import {
        /// Picture files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Orientation in degrees (0, 90, 180 or 270)
        #[arg(long, default_value_t = 0)]
        orientation: i32,

        #[arg(short, long)]
        passphrase: String,
    },

    /// List the vault contents
    List {
        #[arg(short, long)]
        passphrase: String,
    },

    /// Export one picture back to its original path
    Export {
        /// Catalog index, as printed by `list`
        index: usize,

        #[arg(short, long)]
        passphrase: String,
    },

    /// Export every picture back to user storage
    ExportAll {
        #[arg(short, long)]
        passphrase: String,
    },

    /// Delete one picture from the vault
    Remove {
        /// Catalog index, as printed by `list`
        index: usize,

        #[arg(short, long)]
        passphrase: String,
    },

    /// Verify a passphrase without unlocking
    CheckPassphrase {
        #[arg(short, long)]
        passphrase: String,
    },

    /// Change the key passphrase
    ChangePassphrase {
        #[arg(long)]
        old: String,

        #[arg(long)]
        new: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut cfg = EngineConfig::default();
    if let Some(vault) = cli.vault {
        cfg.pics_dir = vault;
    }
    if let Some(key_dir) = cli.key_dir {
        cfg.key_dir = key_dir;
    }
    if let Some(size) = cli.thumb_size {
        cfg.thumbnail_size = size;
    }

    let mut engine = match PicsEngine::new(cfg) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to open the vault: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&mut engine, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(engine: &mut PicsEngine, command: Commands) -> Result<(), String> {
    match command {
        Commands::Status => {
            engine.wait_idle(WAIT);
            println!("state: {}", state_name(engine.foil_state()));
            println!(
                "may have encrypted pictures: {}",
                engine.may_have_encrypted_pictures()
            );
            println!("vault: {}", engine.pics_dir().display());
            Ok(())
        }

        Commands::Generate { bits, passphrase } => {
            engine.wait_idle(WAIT);
            if engine.may_have_encrypted_pictures() {
                return Err(
                    "The vault already holds encrypted pictures; a new key would orphan them"
                        .into(),
                );
            }
            engine.generate_key(bits, &passphrase);
            if engine.foil_state() != FoilState::GeneratingKey {
                return Err(format!(
                    "Cannot generate a key in state {}",
                    state_name(engine.foil_state())
                ));
            }
            engine.wait_idle(WAIT);
            match engine.foil_state() {
                FoilState::PicsReady => {
                    println!("Generated a {bits}-bit key");
                    Ok(())
                }
                state => Err(format!("Key generation failed ({})", state_name(state))),
            }
        }

        Commands::Import {
            paths,
            orientation,
            passphrase,
        } => {
            unlock(engine, &passphrase)?;
            let before = engine.count();
            for path in &paths {
                if !engine.encrypt_file(path, orientation) {
                    return Err(format!("Failed to queue {}", path.display()));
                }
            }
            engine.wait_idle(WAIT);
            let imported = engine.count().saturating_sub(before);
            println!("Imported {imported} of {} picture(s)", paths.len());
            if imported == paths.len() {
                Ok(())
            } else {
                Err("Some sources could not be imported".into())
            }
        }

        Commands::List { passphrase } => {
            unlock(engine, &passphrase)?;
            println!("{} picture(s)", engine.count());
            for index in 0..engine.count() {
                if let Some(entry) = engine.entry(index) {
                    println!(
                        "{index:4}  {}  {}x{}  {}  {}",
                        entry.stored_name,
                        entry.image_width(),
                        entry.image_height(),
                        entry.content_type,
                        entry.title,
                    );
                }
            }
            Ok(())
        }

        Commands::Export { index, passphrase } => {
            unlock(engine, &passphrase)?;
            let (count, dest) = match engine.entry(index) {
                Some(entry) => (engine.count(), entry.original_path.clone()),
                None => return Err(format!("No picture at index {index}")),
            };
            engine.decrypt_at(index);
            wait_for_count(engine, count - 1)?;
            println!("Exported to {}", dest.display());
            Ok(())
        }

        Commands::ExportAll { passphrase } => {
            unlock(engine, &passphrase)?;
            let count = engine.count();
            engine.decrypt_all();
            wait_for_count(engine, 0)?;
            println!("Exported {count} picture(s)");
            Ok(())
        }

        Commands::Remove { index, passphrase } => {
            unlock(engine, &passphrase)?;
            if engine.entry(index).is_none() {
                return Err(format!("No picture at index {index}"));
            }
            engine.remove_at(index);
            engine.wait_idle(WAIT);
            println!("Removed");
            Ok(())
        }

        Commands::CheckPassphrase { passphrase } => {
            if engine.check_password(&passphrase) {
                println!("Passphrase OK");
                Ok(())
            } else {
                Err("Wrong passphrase".into())
            }
        }

        Commands::ChangePassphrase { old, new } => {
            // The key pair has to be in memory to re-encrypt it.
            unlock(engine, &old)?;
            if engine.change_password(&old, &new) {
                println!("Passphrase changed");
                Ok(())
            } else {
                Err("Failed to change the passphrase".into())
            }
        }
    }
}

fn unlock(engine: &mut PicsEngine, passphrase: &str) -> Result<(), String> {
    engine.wait_idle(WAIT);
    if !engine.unlock(passphrase) {
        return Err(format!(
            "Cannot unlock the vault ({})",
            state_name(engine.foil_state())
        ));
    }
    engine.wait_idle(WAIT);
    if engine.foil_state() != FoilState::PicsReady {
        return Err(format!(
            "Vault did not come up ({})",
            state_name(engine.foil_state())
        ));
    }
    Ok(())
}

/// Exports complete outside the busy predicate; poll the catalog.
fn wait_for_count(engine: &mut PicsEngine, expected: usize) -> Result<(), String> {
    let deadline = std::time::Instant::now() + WAIT;
    while engine.count() > expected {
        if std::time::Instant::now() > deadline {
            return Err("Timed out waiting for the export to finish".into());
        }
        engine.pump();
        std::thread::sleep(Duration::from_millis(20));
    }
    engine.wait_idle(WAIT);
    Ok(())
}

fn state_name(state: FoilState) -> &'static str {
    match state {
        FoilState::KeyMissing => "key missing",
        FoilState::KeyInvalid => "key invalid",
        FoilState::KeyNotEncrypted => "key not encrypted",
        FoilState::Locked => "locked",
        FoilState::LockedTimedOut => "locked (timed out)",
        FoilState::Decrypting => "decrypting",
        FoilState::GeneratingKey => "generating key",
        FoilState::KeyError => "key error",
        FoilState::PicsReady => "ready",
    }
}
