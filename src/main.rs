fn main() {
    println!("epq-rs - Error-Propagating Protein Quantification");
    println!();
    println!("🔬 RECOMMENDED: Use the combined tool for most workflows:");
    println!("  epq           - Complete analysis: evidence table → protein q-values (one step)");
    println!();
    println!("📋 Advanced tools for specialized workflows:");
    println!("  epq_convert   - Normalize DIA-NN / MaxQuant evidence into the canonical table");
    println!();
    println!("📖 For help with each tool:");
    println!("  cargo run --bin epq -- --help           # Quantification");
    println!("  cargo run --bin epq_convert -- --help   # Conversion only");
    println!();
    println!("🚀 Quick start examples:");
    println!("  cargo run --bin epq -- evidence.tsv --out-file proteins.tsv");
    println!("  cargo run --bin epq -- report.tsv --input-format diann --mapping runs.tsv --missing-value-prior DIA");
    println!();
    println!("💡 Without at least 3 decoy proteins q-values are reported as NA; PEPs are always reported.");
}
