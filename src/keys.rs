//! Noise static keypair generation and key file I/O.
//!
//! Keys are 32-byte X25519 values stored as one line of lowercase hex.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use snow::Builder;

use crate::noise::{KEY_LEN, NOISE_PARAMS};

/// Generates a fresh X25519 static keypair.
pub fn generate_keypair() -> Result<snow::Keypair> {
    let params = NOISE_PARAMS
        .parse()
        .map_err(|e| anyhow!("noise params: {:?}", e))?;
    Builder::new(params)
        .generate_keypair()
        .map_err(|e| anyhow!("generating keypair: {:?}", e))
}

/// Derives the public key belonging to a private key.
pub fn pubkey_from_privkey(privkey: &[u8]) -> Result<Vec<u8>> {
    let bytes: [u8; KEY_LEN] = privkey
        .try_into()
        .map_err(|_| anyhow!("private key must be {} bytes", KEY_LEN))?;
    let secret = x25519_dalek::StaticSecret::from(bytes);
    Ok(x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec())
}

/// Decodes a key from its hex form.
pub fn decode_key(s: &str) -> Result<Vec<u8>> {
    let key = hex::decode(s).context("invalid hex key")?;
    ensure!(
        key.len() == KEY_LEN,
        "key must be {} hex digits",
        KEY_LEN * 2
    );
    Ok(key)
}

/// Reads a key from a file written by [`write_key_file`].
pub fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    decode_key(contents.trim())
}

/// Writes a key as one hex line, owner-readable only.
pub fn write_key_file(path: &Path, key: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writeln!(file, "{}", hex::encode(key))?;
    Ok(())
}

/// Generates a keypair and writes each half to its file if a path was given,
/// otherwise prints it as hex. Partially written files are removed on error
/// so a failed run leaves nothing behind.
pub fn generate_key_files(
    privkey_file: Option<&Path>,
    pubkey_file: Option<&Path>,
) -> Result<()> {
    let keypair = generate_keypair()?;

    let mut written: Vec<PathBuf> = Vec::new();
    let result = write_key_files(&keypair, privkey_file, pubkey_file, &mut written);
    if let Err(e) = result {
        for path in written {
            eprintln!("deleting partially written file {}", path.display());
            let _ = fs::remove_file(&path);
        }
        return Err(e);
    }

    match privkey_file {
        Some(path) => println!("privkey written to {}", path.display()),
        None => println!("privkey {}", hex::encode(&keypair.private)),
    }
    match pubkey_file {
        Some(path) => println!("pubkey  written to {}", path.display()),
        None => println!("pubkey  {}", hex::encode(&keypair.public)),
    }
    Ok(())
}

fn write_key_files(
    keypair: &snow::Keypair,
    privkey_file: Option<&Path>,
    pubkey_file: Option<&Path>,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    if let Some(path) = privkey_file {
        written.push(path.to_path_buf());
        write_key_file(path, &keypair.private)?;
    }
    if let Some(path) = pubkey_file {
        written.push(path.to_path_buf());
        write_key_file(path, &keypair.public)?;
    }
    // Everything landed; nothing to clean up.
    written.clear();
    Ok(())
}
