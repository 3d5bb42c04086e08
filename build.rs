//! Build script for framegpu.
//!
//! Emits feature diagnostics so integrators can see at a glance which
//! backend and lock implementation a build carries.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_GPU_VULKAN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");

    let vulkan_enabled = env::var("CARGO_FEATURE_GPU_VULKAN").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    if vulkan_enabled {
        emit_info("Vulkan backend enabled (ash)");
        emit_note("Construct VulkanDevice from your instance/device/surface,");
        emit_note("then build your pipeline against VulkanDevice::render_pass()");
        emit_note("and hand it over with install_pipeline().");
    } else {
        emit_note("No GPU backend selected; only DummyDevice is available.");
        emit_note("Enable the Vulkan backend with:");
        emit_note("  framegpu = { version = \"0.1\", features = [\"gpu-vulkan\"] }");
    }

    if parking_lot_enabled {
        emit_info("Using parking_lot for mutexes (faster lock implementation)");
    } else if is_release {
        emit_note("Tip: Consider enabling 'parking_lot' for better mutex performance:");
        emit_note("  framegpu = { version = \"0.1\", features = [\"parking_lot\"] }");
    }
}

fn emit_info(msg: &str) {
    println!("cargo:warning=[framegpu] ℹ️  {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[framegpu]    {}", msg);
}
