//! # berth-image
//!
//! Builds container filesystem images from the ordered setup steps of a
//! manifest container and caches them by content digest.
//!
//! A container that declares a distribution without inheriting another
//! starts from that distribution's published base system.
//!
//! A build runs in `images/.tmp/<id>/root` and is renamed to
//! `images/<container>.<digest>/` only when every step succeeded, so a
//! failed build never leaves a usable image behind.

#![warn(missing_docs)]

pub mod bootstrap;
pub mod builder;
pub mod digest;
pub mod packages;
pub mod steps;
pub mod store;
pub mod users;

pub use bootstrap::RootfsCache;
pub use builder::{Builder, PROJECT_MOUNT};
pub use digest::image_digest;
pub use packages::{
    Apk, Apt, Dnf, PackageResolver, RootfsSource, default_resolvers, detect_distribution,
};
pub use store::{BuiltImage, ImageStore, Scratch};
