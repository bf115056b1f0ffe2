use rerun_except::rerun_except;

fn main() {
    rerun_except(&["gc_tests", "*.md"]).unwrap();
    cc::Build::new()
        .file("src/spill_registers.S")
        .compile("SpillRegisters");
}
