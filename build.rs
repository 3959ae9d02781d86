use std::env;
use std::fs;
use std::path::Path;

const TEMPLATE: &str = include_str!("src/config_template.toml");

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../tsplane.template.toml");

    let _ = fs::write(template_path, TEMPLATE);
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/config_template.toml");
}
