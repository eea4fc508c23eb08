//! Pool password, given directly or as a base64-encoded file.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use vm_messages::{msg, MESSAGES};

use crate::cli::Args;

/// Decode the contents of a password file.
pub fn decode_password(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("password file is not valid base64")?;
    let password = String::from_utf8(bytes).context("decoded password is not UTF-8")?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

pub fn read_password_file(path: &Path) -> Result<String> {
    if !path.exists() {
        bail!(msg!(
            MESSAGES.error_password_file_missing,
            path = path.display()
        ));
    }
    let encoded = fs::read_to_string(path)
        .with_context(|| format!("failed to read password file {}", path.display()))?;
    decode_password(&encoded)
}

pub fn load_password(args: &Args) -> Result<String> {
    match (&args.password, &args.password_file) {
        (Some(password), _) => Ok(password.clone()),
        (None, Some(path)) => read_password_file(path),
        (None, None) => bail!("a password or password file is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_decode_password() {
        assert_eq!(decode_password("c2VjcmV0\n").unwrap(), "secret");
    }

    #[test]
    fn test_decode_strips_encoded_newline() {
        // "secret\n"
        assert_eq!(decode_password("c2VjcmV0Cg==").unwrap(), "secret");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_password("not base64 !!").is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = read_password_file(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_read_password_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pw.b64");
        fs::write(&path, "c2VjcmV0\n").unwrap();
        assert_eq!(read_password_file(&path).unwrap(), "secret");
    }
}
