//! Flash, EEPROM and erase command implementations.

use {
    super::{DeviceLink, DeviceOptions, progress_bar},
    anyhow::{Context, Result, bail},
    chip45flash::{HexRecords, MemoryType, RecordSource},
    console::style,
    log::info,
    std::path::Path,
};

/// Load and validate an Intel HEX file before touching the device.
pub(crate) fn load_records(path: &Path) -> Result<HexRecords> {
    let records = HexRecords::from_file(path)
        .with_context(|| format!("Failed to load HEX file {}", path.display()))?;
    if records.is_empty() {
        bail!("{} contains no records", path.display());
    }
    info!(
        "Loaded {} records ({} bytes) from {}",
        records.len(),
        records.total_size_bytes(),
        path.display()
    );
    Ok(records)
}

/// Program `records` into `memory`, then start the application.
pub(crate) fn cmd_program(
    options: &DeviceOptions,
    records: &HexRecords,
    memory: MemoryType,
) -> Result<()> {
    let mut link = DeviceLink::connect(options)?;

    let pb = progress_bar(options, format!("Programming {memory}"));
    link.upload(&pb, |engine| engine.program(records, memory))?;
    link.disconnect()?;

    if !options.quiet {
        eprintln!(
            "\n{} Programmed {} bytes of {memory}",
            style("🎉").green().bold(),
            records.total_size_bytes()
        );
    }
    Ok(())
}

/// Fill `size` bytes of `memory` with `0xFF`, then start the application.
pub(crate) fn cmd_erase(options: &DeviceOptions, memory: MemoryType, size: usize) -> Result<()> {
    let mut link = DeviceLink::connect(options)?;

    if !options.quiet {
        eprintln!("{} Erasing {size} bytes of {memory}", style("🗑").red());
    }
    let pb = progress_bar(options, format!("Erasing {memory}"));
    link.upload(&pb, |engine| engine.erase(memory, size))?;
    link.disconnect()?;

    if !options.quiet {
        eprintln!("\n{} Erase completed", style("✓").green().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Write as _};

    #[test]
    fn test_load_records_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ":0400000011241FBEEA").unwrap();
        writeln!(file, ":00000001FF").unwrap();

        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.total_size_bytes(), 4);
    }

    #[test]
    fn test_load_records_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = load_records(file.path()).unwrap_err();
        assert!(err.to_string().contains("contains no records"));
    }

    #[test]
    fn test_load_records_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ":00000001FF").unwrap();
        writeln!(file, "not a record").unwrap();

        let err = load_records(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to load HEX file"));
        assert!(matches!(
            err.downcast_ref::<chip45flash::Error>(),
            Some(chip45flash::Error::InvalidRecord { .. })
        ));
    }
}
