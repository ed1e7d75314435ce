//! Signing service material.
//!
//! The `signing_secret` holds an ASCII armored OpenPGP key under
//! [`SIGNING_KEY`]. Pulpcore pods need the fingerprint of its primary key in
//! `PULP_SIGNING_KEY_FINGERPRINT`, which is computed here from the packet
//! data (v4 fingerprint: SHA-1 over the public key packet body).

use sha1::{Digest, Sha1};

use crate::error::{ControllerError, ControllerResult};

pub const SIGNING_KEY: &str = "signing_service.gpg";
pub const COLLECTION_SCRIPT: &str = "collection_script.sh";
pub const CONTAINER_SCRIPT: &str = "container_script.sh";
pub const SCRIPTS_DIR: &str = "/var/lib/pulp/scripts";

const TAG_SECRET_KEY: u8 = 5;
const TAG_PUBLIC_KEY: u8 = 6;

fn invalid(msg: impl Into<String>) -> ControllerError {
    ControllerError::Signing(msg.into())
}

/// Decode the base64 body of an ASCII armored block.
fn dearmor(armored: &str) -> ControllerResult<Vec<u8>> {
    let mut lines = armored.lines().map(str::trim);
    lines
        .by_ref()
        .find(|l| l.starts_with("-----BEGIN PGP"))
        .ok_or_else(|| invalid("missing armor header"))?;

    // armor headers end at the first blank line
    let mut body = String::new();
    let mut in_headers = true;
    for line in lines {
        if line.starts_with("-----END PGP") {
            break;
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
            } else if !line.contains(": ") {
                // no headers at all
                in_headers = false;
                body.push_str(line);
            }
            continue;
        }
        if line.starts_with('=') {
            // CRC24 checksum
            continue;
        }
        body.push_str(line);
    }
    openssl::base64::decode_block(&body).map_err(|e| invalid(format!("bad base64: {}", e)))
}

/// Tag and body of the first packet.
fn first_packet(data: &[u8]) -> ControllerResult<(u8, &[u8])> {
    let header = *data.first().ok_or_else(|| invalid("empty key"))?;
    if header & 0x80 == 0 {
        return Err(invalid("not an OpenPGP packet"));
    }
    let byte = |i: usize| -> ControllerResult<usize> {
        data.get(i)
            .map(|b| *b as usize)
            .ok_or_else(|| invalid("truncated packet header"))
    };
    let (tag, offset, len) = if header & 0x40 != 0 {
        let tag = header & 0x3f;
        let o1 = byte(1)?;
        match o1 {
            0..=191 => (tag, 2, o1),
            192..=223 => (tag, 3, ((o1 - 192) << 8) + byte(2)? + 192),
            255 => (
                tag,
                6,
                (byte(2)? << 24) | (byte(3)? << 16) | (byte(4)? << 8) | byte(5)?,
            ),
            _ => return Err(invalid("partial body length on a key packet")),
        }
    } else {
        let tag = (header >> 2) & 0x0f;
        match header & 0x03 {
            0 => (tag, 2, byte(1)?),
            1 => (tag, 3, (byte(1)? << 8) | byte(2)?),
            2 => (
                tag,
                5,
                (byte(1)? << 24) | (byte(2)? << 16) | (byte(3)? << 8) | byte(4)?,
            ),
            _ => (tag, 1, data.len() - 1),
        }
    };
    let body = data
        .get(offset..offset + len)
        .ok_or_else(|| invalid("truncated packet"))?;
    Ok((tag, body))
}

/// Length of the public key material of a v4 key packet body.
fn public_part_len(body: &[u8]) -> ControllerResult<usize> {
    if body.first() != Some(&4) {
        return Err(invalid("only v4 keys are supported"));
    }
    let algorithm = *body.get(5).ok_or_else(|| invalid("truncated key packet"))?;
    let mut pos = 6;

    let mpi = |pos: &mut usize| -> ControllerResult<()> {
        let bits = match body.get(*pos..*pos + 2) {
            Some(b) => ((b[0] as usize) << 8) | b[1] as usize,
            None => return Err(invalid("truncated MPI")),
        };
        *pos += 2 + (bits + 7) / 8;
        Ok(())
    };
    let prefixed = |pos: &mut usize| -> ControllerResult<()> {
        let len = *body.get(*pos).ok_or_else(|| invalid("truncated key packet"))? as usize;
        *pos += 1 + len;
        Ok(())
    };

    match algorithm {
        // RSA
        1..=3 => (0..2).try_for_each(|_| mpi(&mut pos))?,
        // Elgamal
        16 | 20 => (0..3).try_for_each(|_| mpi(&mut pos))?,
        // DSA
        17 => (0..4).try_for_each(|_| mpi(&mut pos))?,
        // ECDH: curve OID, point, KDF parameters
        18 => {
            prefixed(&mut pos)?;
            mpi(&mut pos)?;
            prefixed(&mut pos)?;
        }
        // ECDSA, EdDSA: curve OID, point
        19 | 22 => {
            prefixed(&mut pos)?;
            mpi(&mut pos)?;
        }
        other => return Err(invalid(format!("unsupported public key algorithm {}", other))),
    }
    if pos > body.len() {
        return Err(invalid("truncated key material"));
    }
    Ok(pos)
}

/// Upper-case hex fingerprint of the primary key in an armored key block.
pub fn fingerprint(armored: &str) -> ControllerResult<String> {
    let data = dearmor(armored)?;
    let (tag, body) = first_packet(&data)?;
    if tag != TAG_PUBLIC_KEY && tag != TAG_SECRET_KEY {
        return Err(invalid(format!("first packet has tag {}, expected a key", tag)));
    }
    let public = &body[..public_part_len(body)?];

    let mut hasher = Sha1::new();
    hasher.update([0x99]);
    hasher.update((public.len() as u16).to_be_bytes());
    hasher.update(public);
    Ok(hex::encode_upper(hasher.finalize()))
}
