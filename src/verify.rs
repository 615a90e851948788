//! Image verification, consulted before an image is swapped in or booted.

use crate::{
    flash::{Flash, FlashArea},
    image::ImageHeader,
};

/// Decides whether an image may be booted.
///
/// `slot` covers exactly the part of the slot an image may occupy, without the trailer.
#[allow(async_fn_in_trait)]
pub trait Verifier<F: Flash> {
    async fn verify(&mut self, flash: &mut F, slot: &FlashArea, header: &ImageHeader) -> bool;
}

/// Accept every image with a valid header.
pub struct AcceptAll;

impl<F: Flash> Verifier<F> for AcceptAll {
    async fn verify(&mut self, _flash: &mut F, _slot: &FlashArea, _header: &ImageHeader) -> bool {
        true
    }
}

#[cfg(feature = "sha256")]
pub use sha256::Sha256Verifier;

#[cfg(feature = "sha256")]
mod sha256 {
    use sha2::{Digest, Sha256};

    use super::Verifier;
    use crate::{
        Error,
        flash::{Flash, FlashArea},
        image::{IMAGE_TLV_SHA256, ImageHeader, TLV_HEADER_SIZE, Tlv},
        log,
        swap::COPY_BUFFER_SIZE,
    };

    const DIGEST_SIZE: usize = 32;
    const TLV_END: u8 = 0xff;

    /// Require a SHA-256 TLV matching header and body.
    pub struct Sha256Verifier;

    impl Sha256Verifier {
        async fn digest<F: Flash>(
            flash: &mut F,
            slot: &FlashArea,
            len: u32,
        ) -> Result<[u8; DIGEST_SIZE], Error> {
            let mut hasher = Sha256::new();
            let mut buf = [0u8; COPY_BUFFER_SIZE];
            let mut offset = 0;
            while offset < len {
                let chunk = (len - offset).min(COPY_BUFFER_SIZE as u32) as usize;
                flash.read(slot, offset, &mut buf[..chunk]).await?;
                hasher.update(&buf[..chunk]);
                offset += chunk as u32;
            }
            let mut digest = [0u8; DIGEST_SIZE];
            digest.copy_from_slice(&hasher.finalize());
            Ok(digest)
        }

        /// Find the SHA-256 TLV following the image body.
        async fn expected<F: Flash>(
            flash: &mut F,
            slot: &FlashArea,
            header: &ImageHeader,
        ) -> Result<Option<[u8; DIGEST_SIZE]>, Error> {
            let mut offset = header.extent();
            while offset + TLV_HEADER_SIZE as u32 <= slot.size {
                let mut raw = [0u8; TLV_HEADER_SIZE];
                flash.read(slot, offset, &mut raw).await?;
                let tlv = Tlv::decode(&raw);
                offset += TLV_HEADER_SIZE as u32;

                if tlv.kind == TLV_END || offset + u32::from(tlv.len) > slot.size {
                    break;
                }
                if tlv.kind == IMAGE_TLV_SHA256 && usize::from(tlv.len) == DIGEST_SIZE {
                    let mut digest = [0u8; DIGEST_SIZE];
                    flash.read(slot, offset, &mut digest).await?;
                    return Ok(Some(digest));
                }
                offset += u32::from(tlv.len);
            }
            Ok(None)
        }

        async fn check<F: Flash>(
            flash: &mut F,
            slot: &FlashArea,
            header: &ImageHeader,
        ) -> Result<bool, Error> {
            let Some(expected) = Self::expected(flash, slot, header).await? else {
                log::warn!("image has no SHA-256 TLV");
                return Ok(false);
            };
            Ok(Self::digest(flash, slot, header.extent()).await? == expected)
        }
    }

    impl<F: Flash> Verifier<F> for Sha256Verifier {
        async fn verify(&mut self, flash: &mut F, slot: &FlashArea, header: &ImageHeader) -> bool {
            match Self::check(flash, slot, header).await {
                Ok(valid) => valid,
                Err(e) => {
                    log::warn!("image verification failed: {:?}", e);
                    false
                }
            }
        }
    }
}
