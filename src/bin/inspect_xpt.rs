use brfss_pipeline::xport::{DecoderChain, ParsedTransport, VariableKind};
use std::{env, fs, path::Path, process::exit};

const PREVIEW_ROWS: usize = 5;

fn main() {
    // Expect a transport file and an optional row count.
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <XPT_FILE> [ROWS]", args[0]);
        exit(1);
    }
    let rows = args
        .get(2)
        .and_then(|n| n.parse().ok())
        .unwrap_or(PREVIEW_ROWS);
    if let Err(e) = inspect_xpt(Path::new(&args[1]), rows) {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

/// Decode the file and print header metadata, variables and the first rows.
fn inspect_xpt(path: &Path, rows: usize) -> Result<(), Box<dyn std::error::Error>> {
    // 1) Decode with the same strategy chain the pipeline uses.
    let bytes = fs::read(path)?;
    let parsed = DecoderChain::default().decode(&bytes).map_err(|attempts| {
        attempts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    })?;

    // 2) Header
    println!("=== Transport File: {} ===", path.display());
    println!("Decoder:              {}", parsed.decoder);
    println!("Dataset:              {}", parsed.dataset);
    println!("Label:                {}", parsed.label);
    println!(
        "Created:              {}",
        parsed
            .created
            .map_or("<unknown>".to_string(), |t| t.to_string())
    );
    println!("Variables:            {}", parsed.variables.len());
    println!("Observations:         {}", parsed.records.len());
    println!("File size on disk:    {} bytes", bytes.len());
    println!();

    // 3) Variables
    println!("=== Variables ===");
    for v in &parsed.variables {
        let kind = match v.kind {
            VariableKind::Numeric => "num",
            VariableKind::Char => "char",
        };
        println!(
            "- {:<8} | {:<4} | len {:>3} | pos {:>5} | {:<8} | {}",
            v.name, kind, v.length, v.position, v.format, v.label
        );
    }
    println!();

    // 4) First rows
    print_rows(&parsed, rows);
    Ok(())
}

fn print_rows(parsed: &ParsedTransport, limit: usize) {
    println!("=== First {} rows ===", limit.min(parsed.records.len()));
    println!(
        "{}",
        parsed.column_names().collect::<Vec<_>>().join("\t")
    );
    for record in parsed.records.iter().take(limit) {
        let cells: Vec<String> = record
            .values
            .iter()
            .map(|v| if v.is_missing() { ".".to_string() } else { v.to_string() })
            .collect();
        println!("{}", cells.join("\t"));
    }
}
