//! Build script for proxy-init
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `proxy-init --version`.

fn main() {
    // Re-run build if the default tool locations change
    println!("cargo:rerun-if-env-changed=PROXY_INIT_IPTABLES");
    println!("cargo:rerun-if-env-changed=PROXY_INIT_IPTABLES_SAVE");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
