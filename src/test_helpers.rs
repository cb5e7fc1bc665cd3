//! Shared test utilities for the pixelmill test suite.
//!
//! Provides synthetic images (so no test depends on fixture files) and a
//! switchable identity provider for exercising visibility rules against one
//! set of stores.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let img = gradient_image(32, 24);
//! let bytes = png_bytes(&img);
//!
//! let identity = SwitchIdentity::new(Some(Identity::new("alice", Role::User)));
//! // hand `Box::new(identity.clone())` to a Service, then:
//! identity.set(None);
//! ```

use crate::identity::{Identity, IdentityProvider};
use crate::imaging::Quality;
use crate::imaging::codec;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::sync::{Arc, Mutex};

// =========================================================================
// Images
// =========================================================================

/// RGB gradient: red rises left to right, green top to bottom, blue fixed.
///
/// Every pixel differs from its neighbours, so flips and rotations are
/// observable.
pub fn gradient_image(width: u32, height: u32) -> DynamicImage {
    let wd = width.saturating_sub(1).max(1);
    let hd = height.saturating_sub(1).max(1);
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / wd) as u8, (y * 255 / hd) as u8, 128])
    });
    DynamicImage::ImageRgb8(img)
}

/// PNG-encoded bytes of `img`.
pub fn png_bytes(img: &DynamicImage) -> Vec<u8> {
    codec::encode(img, ImageFormat::Png, Quality::default()).unwrap()
}

// =========================================================================
// Identity
// =========================================================================

/// Identity provider whose answer a test can change mid-way.
#[derive(Debug, Clone, Default)]
pub struct SwitchIdentity(Arc<Mutex<Option<Identity>>>);

impl SwitchIdentity {
    pub fn new(identity: Option<Identity>) -> Self {
        Self(Arc::new(Mutex::new(identity)))
    }

    pub fn set(&self, identity: Option<Identity>) {
        *self.0.lock().unwrap() = identity;
    }
}

impl IdentityProvider for SwitchIdentity {
    fn current(&self) -> Option<Identity> {
        self.0.lock().unwrap().clone()
    }
}
