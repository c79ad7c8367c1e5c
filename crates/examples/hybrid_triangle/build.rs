use std::env;
use std::error::Error;
use std::path::Path;
use std::process::Command;

fn main() -> Result<(), Box<dyn Error>> {
    // Tell the build script to only run again if we change our source shaders
    println!("cargo:rerun-if-changed=shaders");

    let out_dir = env::var("OUT_DIR")?;

    for entry in std::fs::read_dir("shaders")? {
        let entry = entry?;

        if entry.file_type()?.is_file() {
            let in_path = entry.path();
            let out_path = Path::new(&out_dir).join(format!(
                "{}.spv",
                entry.file_name().to_string_lossy()
            ));

            let output = Command::new("glslc")
                .arg(&in_path)
                .arg("--target-env=vulkan1.2")
                .arg("-o")
                .arg(&out_path)
                .output()
                .map_err(|e| format!("Failed to invoke glslc: {e}"))?;

            if !output.status.success() {
                eprint!("{}", String::from_utf8_lossy(&output.stderr));
                return Err(format!(
                    "Failed to compile shader {:?}. Status: {}",
                    in_path, output.status
                )
                .into());
            }
        }
    }

    Ok(())
}
