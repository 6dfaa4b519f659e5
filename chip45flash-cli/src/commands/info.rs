//! HEX file info and port listing command implementations.

use {
    super::program::load_records,
    anyhow::Result,
    chip45flash::{HexRecords, MemoryType, RecordSource, auto_detect_port, detect_ports},
    console::style,
    std::path::Path,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

/// Pages of `memory` touched by `records`.
fn pages(records: &HexRecords, memory: MemoryType) -> usize {
    records.total_size_bytes().div_ceil(memory.page_size())
}

/// Info command implementation.
pub(crate) fn cmd_info(path: &Path, json: bool) -> Result<()> {
    let records = load_records(path)?;

    if json {
        let range = records.address_range().map(|(start, end)| {
            serde_json::json!({
                "start": format!("0x{start:05X}"),
                "end": format!("0x{end:05X}"),
            })
        });
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": path.display().to_string(),
                "records": records.len(),
                "bytes": records.total_size_bytes(),
                "address_range": range,
                "flash_pages": pages(&records, MemoryType::Flash),
                "eeprom_pages": pages(&records, MemoryType::Eeprom),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("HEX file {}", path.display())).bold().underlined()
    );
    eprintln!("  Records:       {}", records.len());
    eprintln!("  Payload bytes: {}", records.total_size_bytes());
    match records.address_range() {
        Some((start, end)) => eprintln!("  Address range: 0x{start:05X} - 0x{end:05X}"),
        None => eprintln!("  Address range: {}", style("none").dim()),
    }
    eprintln!(
        "  Pages:         {} flash ({} bytes each), {} EEPROM ({} bytes each)",
        pages(&records, MemoryType::Flash),
        MemoryType::Flash.page_size(),
        pages(&records, MemoryType::Eeprom),
        MemoryType::Eeprom.page_size()
    );

    Ok(())
}
