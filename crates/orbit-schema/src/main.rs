use std::path::PathBuf;
use std::process;

use orbit_schema::CompileOptions;
use orbit_schema::error::SchemaError;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (options, files) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: orbit-schemac [--all] [-I <dir>]... <file.ice>...");
            eprintln!();
            eprintln!("Prints the compiled interface descriptors as JSON.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --all          Also emit interfaces from included files");
            eprintln!("  -I <dir>       Add an include directory (repeatable)");
            process::exit(2);
        }
    };

    if let Err(e) = run(&options, &files) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(CompileOptions, Vec<PathBuf>), String> {
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Err(String::new());
    }
    let (options, files) = CompileOptions::from_args(args).map_err(|e| e.to_string())?;
    if files.is_empty() {
        return Err("missing required argument: <file.ice>".to_string());
    }
    Ok((options, files))
}

fn run(options: &CompileOptions, files: &[PathBuf]) -> Result<(), SchemaError> {
    let descriptors = orbit_schema::compile_files(files, options)?;

    let json = serde_json::to_string_pretty(&descriptors)
        .map_err(|e| SchemaError::Output(format!("JSON serialization failed: {e}")))?;
    println!("{json}");

    Ok(())
}
