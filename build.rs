// Build script to compile the builtin GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADER_DIR: &str = "assets/shaders";
const SHADERS: &[&str] = &["builtin.object_shader.vert", "builtin.object_shader.frag"];

fn main() {
    println!("cargo:rerun-if-changed={}", SHADER_DIR);

    for shader in SHADERS {
        let input = format!("{}/{}", SHADER_DIR, shader);
        let output = format!("{}/{}.spv", SHADER_DIR, shader);
        compile_shader(&input, &output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    if !input_path.exists() {
        println!("cargo:warning=Shader source {} missing, skipping", input);
        return;
    }

    // Check if glslc is available
    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // The headless backend and the tests never read these files
            println!("cargo:warning=glslc not found ({}); {} not compiled", e, input);
            println!("cargo:warning=  glslc {} -o {}", input, output);
        }
    }
}
