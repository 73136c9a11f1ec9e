//! obfs2 ("The Twobfuscator") client transport.
//!
//! The handshake, as the initiator sees it:
//!
//! ```text
//! send: INIT_SEED(16) | E_init_pad(MAGIC | PADLEN) | E_init_pad(pad[PADLEN])
//! recv: RESP_SEED(16) | E_resp_pad(MAGIC | PADLEN) | pad[PADLEN] (discarded)
//! ```
//!
//! where `E_x` is AES-128-CTR under a key MAC-derived from the respective
//! seed. Once both seeds are known the session keys are derived from their
//! concatenation and the splice runs both directions through plain AES-CTR;
//! there is no framing and no MAC on payload data. obfs2 obfuscates, it does
//! not authenticate.

use bytes::Buf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{mac, Aes128Ctr, SecureRandom};
use crate::error::{Error, Result};
use crate::session::{SessionIo, Transport};
use crate::socks::proto::Reply;
use crate::socks::{TransportDescriptor, TransportFactory};

/// Method name announced to the host.
pub const METHOD_NAME: &str = "obfs2";

/// Handshake sanity marker, sent big-endian inside the encrypted header.
pub const MAGIC: u32 = 0x2bf5_ca7e;

/// Seed length in bytes.
pub const SEED_LEN: usize = 16;

/// Largest padding length either side may announce.
pub const MAX_PADDING: u32 = 8192;

/// Encrypted header length: MAGIC plus PADLEN, both 32-bit.
const HDR_LEN: usize = 8;

const INIT_PAD_LABEL: &[u8] = b"Initiator obfuscation padding";
const RESP_PAD_LABEL: &[u8] = b"Responder obfuscation padding";
const INIT_DATA_LABEL: &[u8] = b"Initiator obfuscated data";
const RESP_DATA_LABEL: &[u8] = b"Responder obfuscated data";

/// A 16-byte handshake seed, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Seed([u8; SEED_LEN]);

impl Seed {
    fn zero() -> Self {
        Self([0u8; SEED_LEN])
    }
}

/// obfs2 client-side session state.
///
/// The cipher contexts are unkeyed until the handshake installs them: the
/// initiator cipher first carries the pad key (header and padding emission),
/// then both are replaced by the session keys once the responder header has
/// been validated.
pub struct Obfs2Client {
    init_seed: Seed,
    resp_seed: Seed,
    initiator: Option<Aes128Ctr>,
    responder: Option<Aes128Ctr>,
    received_seed_hdr: bool,
    resp_pad_len: usize,
}

impl Obfs2Client {
    /// Create a fresh session in its pre-handshake state.
    pub fn new() -> Self {
        Self {
            init_seed: Seed::zero(),
            resp_seed: Seed::zero(),
            initiator: None,
            responder: None,
            received_seed_hdr: false,
            resp_pad_len: 0,
        }
    }

    /// Transport descriptor for registering obfs2 with a SOCKS5 listener.
    ///
    /// obfs2 takes no per-session parameters, so plain NO-AUTH negotiation
    /// is used and any RFC 1929 fields would be ignored.
    pub fn descriptor() -> TransportDescriptor {
        let factory: TransportFactory =
            std::sync::Arc::new(|_params| Box::new(Obfs2Client::new()));
        TransportDescriptor {
            name: METHOD_NAME,
            needs_session_params: false,
            factory,
        }
    }

    /// Derive the session keys from both seeds and install them.
    ///
    /// INIT_SECRET = MAC("Initiator obfuscated data", INIT_SEED|RESP_SEED)
    /// RESP_SECRET = MAC("Responder obfuscated data", INIT_SEED|RESP_SEED)
    ///
    /// Key and IV are the two halves of each secret.
    fn kdf(&mut self) -> Result<()> {
        let mut seeds = [0u8; SEED_LEN * 2];
        seeds[..SEED_LEN].copy_from_slice(&self.init_seed.0);
        seeds[SEED_LEN..].copy_from_slice(&self.resp_seed.0);

        let init_secret = mac(INIT_DATA_LABEL, &seeds)?;
        let resp_secret = mac(RESP_DATA_LABEL, &seeds)?;
        self.initiator = Some(Aes128Ctr::new(&init_secret)?);
        self.responder = Some(Aes128Ctr::new(&resp_secret)?);

        seeds.zeroize();
        Ok(())
    }
}

impl Default for Obfs2Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Obfs2Client {
    fn on_outgoing_connected(&mut self, io: &mut SessionIo) -> Result<()> {
        tracing::debug!("starting obfs2 handshake");

        SecureRandom::fill(&mut self.init_seed.0);
        let pad_key = mac(INIT_PAD_LABEL, &self.init_seed.0)?;
        let mut initiator = Aes128Ctr::new(&pad_key)?;

        let padlen = sample_pad_len();
        let mut hdr = [0u8; HDR_LEN];
        hdr[..4].copy_from_slice(&MAGIC.to_be_bytes());
        hdr[4..].copy_from_slice(&padlen.to_be_bytes());
        initiator.apply(&mut hdr);

        io.write_outgoing(&self.init_seed.0);
        io.write_outgoing(&hdr);

        if padlen > 0 {
            // Encrypting the padding keeps the cipher counter in step with
            // what the responder computes for the same byte count.
            let mut padding = vec![0u8; padlen as usize];
            SecureRandom::fill(&mut padding);
            initiator.apply(&mut padding);
            io.write_outgoing(&padding);
        }

        self.initiator = Some(initiator);
        Ok(())
    }

    fn on_outgoing_data_connecting(&mut self, io: &mut SessionIo) -> Result<()> {
        if !self.received_seed_hdr {
            if io.outgoing_buf().len() < SEED_LEN + HDR_LEN {
                return Ok(());
            }

            let buf = io.outgoing_buf();
            self.resp_seed.0.copy_from_slice(&buf[..SEED_LEN]);
            let mut hdr = [0u8; HDR_LEN];
            hdr.copy_from_slice(&buf[SEED_LEN..SEED_LEN + HDR_LEN]);
            buf.advance(SEED_LEN + HDR_LEN);

            let pad_key = mac(RESP_PAD_LABEL, &self.resp_seed.0)?;
            let mut responder = Aes128Ctr::new(&pad_key)?;
            responder.apply(&mut hdr);

            let magic = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
            if magic != MAGIC {
                return Err(Error::handshake("invalid magic value from peer"));
            }
            let padlen = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
            if padlen > MAX_PADDING {
                return Err(Error::handshake(format!(
                    "peer claims to have sent {} bytes of padding",
                    padlen
                )));
            }
            self.resp_pad_len = padlen as usize;

            self.kdf()?;
            self.received_seed_hdr = true;
        }

        // Discard responder padding; it may trickle in over several reads.
        if self.resp_pad_len > 0 {
            let buf = io.outgoing_buf();
            let drain = self.resp_pad_len.min(buf.len());
            buf.advance(drain);
            self.resp_pad_len -= drain;
            if self.resp_pad_len > 0 {
                return Ok(());
            }
        }

        tracing::debug!("obfs2 handshake complete");
        io.send_socks5_response(Reply::Succeeded);
        Ok(())
    }

    fn on_incoming_data(&mut self, io: &mut SessionIo) -> Result<()> {
        let cipher = self
            .initiator
            .as_mut()
            .ok_or_else(|| Error::crypto("initiator cipher not keyed"))?;

        let mut data = io.incoming_buf().split();
        if data.is_empty() {
            return Ok(());
        }
        cipher.apply(&mut data);
        io.write_outgoing(&data);
        tracing::trace!(len = data.len(), "sent payload to peer");
        Ok(())
    }

    fn on_outgoing_data(&mut self, io: &mut SessionIo) -> Result<()> {
        let cipher = self
            .responder
            .as_mut()
            .ok_or_else(|| Error::crypto("responder cipher not keyed"))?;

        let mut data = io.outgoing_buf().split();
        if data.is_empty() {
            return Ok(());
        }
        cipher.apply(&mut data);
        io.write_incoming(&data);
        tracing::trace!(len = data.len(), "received payload from peer");
        Ok(())
    }
}

/// Draw a padding length.
///
/// Matches the deployed sampler: draw 32 bits, mask to 0..=0x2fff, reject
/// anything over [`MAX_PADDING`]. The result is biased toward the lower half
/// of the range; interoperability wants that bias kept rather than fixed.
fn sample_pad_len() -> u32 {
    loop {
        let v = SecureRandom::u32() & 0x2fff;
        if v <= MAX_PADDING {
            return v;
        }
    }
}
