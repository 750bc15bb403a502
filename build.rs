//! Build script for generating shared WGSL constants for the fusion kernels

use std::{env, fs, io, path::Path};

// Keep in sync with src/perspective/mod.rs and src/fusion/gaussian.rs
const MAX_PERSPECTIVES: u32 = 10;
const MAX_KERNEL_RADIUS: u32 = 8;

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/fusion/shaders");

    let out_dir = env::var("OUT_DIR").map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
    let constants_path = Path::new(&out_dir).join("fusion_constants.wgsl");

    fs::write(&constants_path, generate_wgsl_constants())?;
    Ok(())
}

/// Generate WGSL constants
fn generate_wgsl_constants() -> String {
    format!(
        r#"// AUTO-GENERATED FUSION CONSTANTS - DO NOT EDIT
// Generated by build.rs

const MAX_PERSPECTIVES: u32 = {}u;
const MAX_KERNEL_RADIUS: u32 = {}u;

const INVALID_DEPTH: f32 = -1.0;
const WEIGHT_EPSILON: f32 = 0.000001;
const TABLE_SENTINEL: i32 = -1;
"#,
        MAX_PERSPECTIVES, MAX_KERNEL_RADIUS,
    )
}
