//! SSH host key handling: a 2048-bit RSA key at a fixed path, generated on
//! first start.

use anyhow::Context as _;
use camino::Utf8Path;
use russh::keys::ssh_key;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;

const HOST_KEY_BITS: usize = 2048;

pub fn load_or_generate_host_key(path: &Utf8Path) -> anyhow::Result<russh::keys::PrivateKey> {
    if path.exists() {
        russh::keys::load_secret_key(path, None).with_context(|| format!("couldn't load host key from {path}"))
    } else {
        info!(%path, "Generating new SSH host key");

        let keypair = RsaKeypair::random(&mut OsRng, HOST_KEY_BITS).context("RSA key generation failed")?;
        let key = ssh_key::PrivateKey::new(KeypairData::Rsa(keypair), "drawbridge host key")
            .context("couldn't assemble host key")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("couldn't create host key directory")?;
        }
        key.write_openssh_file(path.as_std_path(), ssh_key::LineEnding::LF)
            .with_context(|| format!("couldn't persist host key to {path}"))?;

        Ok(key)
    }
}
