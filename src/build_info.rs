mod raw {
    // The constants generated by `built` in build.rs. See https://docs.rs/built/latest/built/index.html
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// rtgc crate version such as 0.1.0
pub const RTGC_PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const RTGC_FEATURES: &str = raw::FEATURES_STR;

/// `release` for release builds, `debug` for other builds.
pub const RTGC_PROFILE: &str = raw::PROFILE;

/// The target triple this crate was compiled for.
pub const RTGC_TARGET: &str = raw::TARGET;

/// A one-line description of this build, printed when a heap is created.
pub fn describe() -> String {
    format!(
        "rtgc {} ({}, {}) features: [{}]",
        RTGC_PKG_VERSION, RTGC_PROFILE, RTGC_TARGET, RTGC_FEATURES
    )
}
