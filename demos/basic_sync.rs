// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two devices reconciling through one shared remote document.
//!
//! Demonstrates:
//! 1. Seeding default categories on each device
//! 2. Recording entries offline on both devices
//! 3. Syncing both ways until they converge
//! 4. Comparing live counts through the control surface
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_sync
//! ```

use std::sync::Arc;

use chrono::NaiveDate;
use ledger_sync::{
    Command, EntryKind, Ledger, LedgerEntry, LedgerSyncConfig, MemoryLocalStore, MemoryRemote,
    Reconciler, YearMonth,
};
use rust_decimal::Decimal;

fn entry(description: &str, amount: Decimal, category: &str, day: u32) -> LedgerEntry {
    LedgerEntry {
        kind: EntryKind::Expense,
        description: description.into(),
        amount,
        category: category.into(),
        timestamp: NaiveDate::from_ymd_opt(2024, 3, day)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap_or_default(),
        instrument: None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           ledger-sync: Two Devices, One Remote                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    let remote = Arc::new(MemoryRemote::new());
    let phone = Reconciler::new(
        Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default()),
        Arc::clone(&remote),
    );
    let laptop = Reconciler::new(
        Ledger::new(Arc::new(MemoryLocalStore::new()), LedgerSyncConfig::default()),
        Arc::clone(&remote),
    );

    println!("📦 Seeding default categories...");
    for device in [&phone, &laptop] {
        let seeded = device.ledger().ensure_default_categories().await?;
        println!("   └─ seeded {seeded} categories");
    }

    println!("\n📝 Recording entries offline...");
    phone
        .ledger()
        .add_entry(entry("coffee", Decimal::new(450, 2), "Food", 4))
        .await?;
    laptop
        .ledger()
        .add_entry(entry("train ticket", Decimal::new(1280, 2), "Transport", 6))
        .await?;
    println!("   └─ phone: coffee, laptop: train ticket");

    println!("\n🔄 Syncing...");
    for (name, device) in [("phone", &phone), ("laptop", &laptop), ("phone", &phone)] {
        let report = device.sync().await?;
        println!(
            "   └─ {name}: {} local writes, {} new identities",
            report.applied.writes(),
            report.identities_assigned
        );
    }

    println!("\n📊 Compare (laptop):");
    let outcome = laptop.run(Command::Compare).await;
    for line in outcome.status.lines() {
        println!("   {line}");
    }

    if let Some(month) = YearMonth::new(2024, 3) {
        for (name, device) in [("phone", &phone), ("laptop", &laptop)] {
            let entries = device.ledger().entries_in_month(month).await?;
            println!("\n📖 {name}, March 2024:");
            for e in entries {
                println!("   └─ {} {} ({})", e.payload.description, e.payload.amount, e.payload.category);
            }
        }
    }

    println!("\n✅ Done");
    Ok(())
}
