use clap::Parser;
use privtest_vm::harness::layout::CodeLayout;
use privtest_vm::harness::table::parse_vectors;
use privtest_vm::loader::load_elf;
use privtest_vm::csr::{CSR_MCAUSE, CSR_MEPC, CSR_MTVEC, CSR_SATP};
use privtest_vm::pmp::MAX_PMP_ENTRIES;
use privtest_vm::snapshot::{Snapshot, digest_words};
use privtest_vm::{Harness, HarnessConfig, Hart, Mode};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Assembled test image (ELF) carrying the harness labels and table
    #[arg(short, long, conflicts_with = "vectors")]
    image: Option<PathBuf>,

    /// Test-vector file (`.4byte address, value, label` lines)
    #[arg(short, long)]
    vectors: Option<PathBuf>,

    /// DRAM base address (hex accepted)
    #[arg(long, default_value = "0x80000000", value_parser = parse_u64)]
    dram_base: u64,

    /// DRAM size in KiB
    #[arg(long, default_value_t = 4096)]
    mem_kib: usize,

    /// Number of implemented PMP entries (0..=16)
    #[arg(long, default_value_t = 16)]
    pmp_entries: usize,

    /// Maximum number of dispatched records before a runaway halt
    #[arg(long, default_value_t = 4096)]
    max_cases: usize,

    /// Write the result buffer as a signature file (one hex word per line)
    #[arg(long)]
    signature: Option<PathBuf>,

    /// Compare the result buffer against a reference signature
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Write a bincode hart snapshot after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Check and print a snapshot written by `--snapshot`, then exit
    #[arg(long, conflicts_with_all = ["image", "vectors"])]
    inspect: Option<PathBuf>,
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{}`: {}", text, e))
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

/// Parse a signature file: one hex word per line, blank lines ignored.
fn read_signature(text: &str) -> Result<Vec<u32>, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            u32::from_str_radix(line.trim_start_matches("0x"), 16)
                .map_err(|e| format!("reference line {}: {}", i + 1, e))
        })
        .collect()
}

fn inspect_snapshot(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    print_section("SNAPSHOT");
    print_info("File", &path.display().to_string());
    let snapshot = Snapshot::decode(&fs::read(path)?)?;
    snapshot.verify()?;
    print_info("Version", &snapshot.version);

    let mut hart = Hart::new(snapshot.hart.pc, MAX_PMP_ENTRIES);
    snapshot.hart.restore(&mut hart);
    print_info("PC", &format!("0x{:08X}", hart.pc));
    print_info("Mode", &format!("{:?}", hart.mode));
    hart.mode = Mode::Machine;
    for (name, csr) in [
        ("mcause", CSR_MCAUSE),
        ("mepc", CSR_MEPC),
        ("mtvec", CSR_MTVEC),
        ("satp", CSR_SATP),
    ] {
        print_info(name, &format!("0x{:08X}", hart.read_csr(csr).unwrap_or_default()));
    }

    for region in &snapshot.memory {
        print_info(
            &format!("0x{:08X}", region.base),
            &format!("{} bytes, sha256 {}", region.size, region.hash),
        );
    }
    print_status("Snapshot", "VERIFIED", true);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.inspect {
        return inspect_snapshot(path);
    }

    // ─── MEMORY MAP ───────────────────────────────────────────────────────────
    print_section("MEMORY MAP");
    let dram_size = args
        .mem_kib
        .checked_mul(1024)
        .ok_or("Requested memory size is too large")?;
    let mut config = HarnessConfig::for_dram(args.dram_base, dram_size);
    config.pmp_entries = args.pmp_entries.min(MAX_PMP_ENTRIES);
    config.max_test_cases = args.max_cases;
    print_info("DRAM Base", &format!("0x{:08X}", args.dram_base));
    print_info("DRAM Size", &format!("{} KiB ({} bytes)", args.mem_kib, dram_size));
    print_info("PMP Entries", &config.pmp_entries.to_string());

    // ─── TEST IMAGE ───────────────────────────────────────────────────────────
    print_section("TEST IMAGE");
    let mut harness = match (&args.image, &args.vectors) {
        (Some(path), _) => {
            print_info("Image", &path.display().to_string());
            let buffer = fs::read(path)?;
            // Symbols decide the regions, so load into a scratch bus first.
            let mut scratch = privtest_vm::bus::SystemBus::new(args.dram_base, dram_size);
            let image = load_elf(&buffer, &mut scratch)?;
            config.apply_symbols(&image.symbols)?;
            let layout = CodeLayout::from_symbols(&image.symbols)?;
            let mut harness = Harness::new(config, layout)?;
            harness.bus = scratch;
            print_info("Entry", &format!("0x{:08X}", image.entry));
            harness
        }
        (None, Some(path)) => {
            print_info("Vectors", &path.display().to_string());
            let text = fs::read_to_string(path)?;
            let cases = parse_vectors(&text)?;
            print_info("Records", &cases.len().to_string());
            let mut harness = Harness::with_default_layout(config)?;
            harness.load_table(&cases)?;
            harness
        }
        (None, None) => return Err("either --image or --vectors is required".into()),
    };
    print_info("Trap Handler", &format!("0x{:08X}", harness.layout.trap_handler));
    print_info("Test Table", &format!("0x{:08X}", harness.config.table_base));
    print_info("Result Buffer", &format!("0x{:08X}", harness.config.results_base));
    print_status("Harness", "LOADED", true);

    // ─── RUN ──────────────────────────────────────────────────────────────────
    print_section("RUN");
    harness.boot()?;
    let outcome = harness.run()?;
    print_info("Records", &outcome.cases_run.to_string());
    print_info("Words Recorded", &outcome.results.len().to_string());
    for (i, word) in outcome.results.iter().enumerate() {
        print_info(&format!("[{:4}]", i), &format!("0x{:08x}", word));
    }
    print_info("SHA-256", &digest_words(&outcome.results));
    print_status("Halt", &outcome.halt.to_string(), outcome.halt.is_clean());

    let mut ok = outcome.halt.is_clean();

    if let Some(path) = &args.signature {
        let text: String = outcome
            .results
            .iter()
            .map(|word| format!("{:08x}\n", word))
            .collect();
        fs::write(path, text)?;
        print_info("Signature", &path.display().to_string());
    }

    if let Some(path) = &args.reference {
        let expected = read_signature(&fs::read_to_string(path)?)?;
        let mut mismatches = 0;
        for i in 0..expected.len().max(outcome.results.len()) {
            let (got, want) = (outcome.results.get(i), expected.get(i));
            if got != want {
                mismatches += 1;
                log::warn!("signature word {}: got {:08x?}, expected {:08x?}", i, got, want);
            }
        }
        print_status(
            "Reference",
            &format!("{} mismatches", mismatches),
            mismatches == 0,
        );
        ok &= mismatches == 0;
    }

    if let Some(path) = &args.snapshot {
        fs::write(path, harness.snapshot()?.encode()?)?;
        print_info("Snapshot", &path.display().to_string());
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64_accepts_hex_and_decimal() {
        assert_eq!(parse_u64("0x8000_0000"), Ok(0x8000_0000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xZZ").is_err());
    }

    #[test]
    fn test_read_signature() {
        assert_eq!(
            read_signature("cafebabe\n\n0000000b\n"),
            Ok(vec![0xCAFE_BABE, 0xB])
        );
        assert!(read_signature("nothex").is_err());
    }
}
