//! FQDN scrambling for inter-PLMN topology hiding.
//!
//! A scrambled label is the 5-character key-generation prefix followed by
//! the unpadded Base32 encoding of an AES-256-GCM encryption of the clear
//! label. The per-key nonce is fixed so a given label always scrambles to
//! the same value; the authentication tag lets descrambling detect
//! wrong-key or tampered input.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use data_encoding::BASE32_NOPAD;

use crate::config::FqdnTransform;
use crate::context::{RootConfig, RunState, ScramblingKey};
use crate::error::ModifierFailure;

/// 96-bit nonce, 96-bit tag.
type LabelCipher = AesGcm<Aes256, U12, U12>;

/// Length of the key-generation prefix on every scrambled label.
pub(crate) const GENERATION_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrambleDirection {
    Scramble,
    Descramble,
}

/// Scramble or descramble a value per the run's roaming-partner profile.
pub(crate) fn apply(
    direction: ScrambleDirection,
    transform: FqdnTransform,
    value: &str,
    root: &RootConfig,
    run: &RunState,
) -> Result<String, ModifierFailure> {
    if value.is_empty() {
        return Err(ModifierFailure::FqdnUnmodifiable);
    }
    // IP addresses pass through untouched.
    if value.parse::<std::net::IpAddr>().is_ok() {
        return Err(ModifierFailure::FqdnIsIp);
    }

    let partner = run.roaming_partner().unwrap_or("");
    let profile = root
        .scrambling_profile(partner)
        .ok_or_else(|| ModifierFailure::EncryptionProfileNotFound(partner.to_string()))?;

    match transform {
        FqdnTransform::OnlyFqdn => transcode(direction, value, profile),
        FqdnTransform::OnlyLabel => {
            let (stem, suffix) = root.split_plmn_suffix(value);
            let (label, rest) = match stem.find('.') {
                Some(pos) => (&stem[..pos], &stem[pos..]),
                None => (stem, ""),
            };
            if label.is_empty() {
                return Err(ModifierFailure::FqdnUnmodifiable);
            }
            let out = transcode(direction, label, profile)?;
            Ok(format!("{}{}{}", out, rest, suffix.unwrap_or("")))
        }
    }
}

fn transcode(
    direction: ScrambleDirection,
    label: &str,
    profile: &crate::context::ScramblingProfile,
) -> Result<String, ModifierFailure> {
    match direction {
        ScrambleDirection::Scramble => scramble_label(label, profile.active_key()),
        ScrambleDirection::Descramble => {
            if label.len() <= GENERATION_LEN {
                return Err(ModifierFailure::FqdnUnmodifiable);
            }
            let (generation, encoded) = label.split_at(GENERATION_LEN);
            let key = profile
                .key_for_generation(generation)
                .ok_or_else(|| ModifierFailure::IncorrectEncryptionId(generation.to_string()))?;
            descramble_label(encoded, key)
        }
    }
}

fn scramble_label(label: &str, key: &ScramblingKey) -> Result<String, ModifierFailure> {
    let cipher = LabelCipher::new(GenericArray::from_slice(&key.key));
    let nonce = GenericArray::from_slice(&key.iv);
    let sealed = cipher
        .encrypt(nonce, label.as_bytes())
        .map_err(|_| ModifierFailure::FqdnUnmodifiable)?;
    Ok(format!("{}{}", key.generation, BASE32_NOPAD.encode(&sealed)))
}

fn descramble_label(encoded: &str, key: &ScramblingKey) -> Result<String, ModifierFailure> {
    // Base32 is case-insensitive on the wire; the encoder emits uppercase.
    let sealed = BASE32_NOPAD
        .decode(encoded.to_ascii_uppercase().as_bytes())
        .map_err(|_| ModifierFailure::FqdnUnmodifiable)?;
    let cipher = LabelCipher::new(GenericArray::from_slice(&key.key));
    let nonce = GenericArray::from_slice(&key.iv);
    let clear = cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| ModifierFailure::FqdnUnmodifiable)?;
    String::from_utf8(clear).map_err(|_| ModifierFailure::FqdnUnmodifiable)
}
