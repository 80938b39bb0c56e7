//! Build provenance baked in by `build.rs`.

/// Commit the binary was built from, `unknown` outside a git checkout.
pub const GIT_REV: &str = match option_env!("SUBPROC_GIT_REV") {
    Some(rev) => rev,
    None => "unknown",
};

/// UTC build time in RFC 3339 form.
pub const BUILT_AT: &str = match option_env!("SUBPROC_BUILT_AT") {
    Some(at) => at,
    None => "unknown",
};

/// `subprocd 0.1.0 (rev 1a2b3c4d5e6f, built 2026-10-18T09:12:44Z)`
pub fn version_line(package: &str, version: &str) -> String {
    format!("{} {} (rev {}, built {})", package, version, GIT_REV, BUILT_AT)
}
