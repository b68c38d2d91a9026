use crate::{Error, Result};
use aes::Aes256;
use ofb::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

type Aes256Ofb = ofb::Ofb<Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

const BUFFER_SIZE: usize = 64 * 1024;

/// Symmetric wrapper applied to archives before they leave the machine.
/// The output is the IV followed by the AES-256-OFB keystream applied to
/// the payload. There is no authentication tag; integrity is checked
/// against the remote tree hash instead.
pub struct Envelope {
    key: [u8; KEY_SIZE],
}

impl Envelope {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| {
            Error::Cipher(format!("Key must be {} bytes, got {}", KEY_SIZE, key.len()))
        })?;
        Ok(Self { key })
    }

    fn cipher(&self, iv: &[u8]) -> Result<Aes256Ofb> {
        Aes256Ofb::new_from_slices(&self.key, iv).map_err(|e| Error::Cipher(e.to_string()))
    }

    pub fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut body = payload.to_vec();
        self.cipher(&iv)?.apply_keystream(&mut body);

        let mut result = iv.to_vec();
        result.extend_from_slice(&body);
        Ok(result)
    }

    pub fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < IV_SIZE {
            return Err(Error::Cipher("Ciphertext too short".to_string()));
        }

        let (iv, body) = ciphertext.split_at(IV_SIZE);
        let mut payload = body.to_vec();
        self.cipher(iv)?.apply_keystream(&mut payload);
        Ok(payload)
    }

    /// Encrypts `source` into a new temporary file.
    pub fn wrap_file(&self, source: &Path) -> Result<NamedTempFile> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let mut cipher = self.cipher(&iv)?;

        let input = File::open(source).map_err(|e| Error::path(source, e))?;
        let output = NamedTempFile::new()?;
        {
            let mut writer = BufWriter::new(output.as_file());
            writer.write_all(&iv)?;
            stream(&mut cipher, BufReader::new(input), &mut writer)?;
            writer.flush()?;
        }

        tracing::debug!(source = %source.display(), "Wrapped file");
        Ok(output)
    }

    /// Decrypts `source` into a new temporary file.
    pub fn unwrap_file(&self, source: &Path) -> Result<NamedTempFile> {
        let input = File::open(source).map_err(|e| Error::path(source, e))?;
        let mut reader = BufReader::new(input);

        let mut iv = [0u8; IV_SIZE];
        reader.read_exact(&mut iv).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Cipher("Ciphertext too short".to_string()),
            _ => Error::path(source, e),
        })?;
        let mut cipher = self.cipher(&iv)?;

        let output = NamedTempFile::new()?;
        {
            let mut writer = BufWriter::new(output.as_file());
            stream(&mut cipher, reader, &mut writer)?;
            writer.flush()?;
        }

        tracing::debug!(source = %source.display(), "Unwrapped file");
        Ok(output)
    }
}

fn stream<R: Read, W: Write>(cipher: &mut Aes256Ofb, mut reader: R, writer: &mut W) -> Result<()> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        cipher.apply_keystream(&mut buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }
}
