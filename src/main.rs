// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate num_cpus;
extern crate rand;
extern crate rucene_flush;

use rucene_flush::core::index::writer::{DocumentsWriter, IndexWriterConfig, IndexingBuffer};
use rucene_flush::error::Result;

use rand::{thread_rng, Rng};

use std::env;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time;

// simulated write throughput of a flush
const FLUSH_BYTES_PER_MS: u64 = 1024 * 1024;

#[derive(Default)]
struct SyntheticBuffer {
    bytes: u64,
    num_docs: u32,
    num_delete_terms: u32,
}

struct SyntheticSegment {
    num_docs: u32,
    bytes: u64,
}

impl IndexingBuffer for SyntheticBuffer {
    type Segment = SyntheticSegment;

    fn bytes_used(&self) -> u64 {
        self.bytes
    }

    fn num_docs_in_ram(&self) -> u32 {
        self.num_docs
    }

    fn num_delete_terms(&self) -> u32 {
        self.num_delete_terms
    }

    fn flush(&mut self, _segment_name: &str) -> Result<SyntheticSegment> {
        thread::sleep(time::Duration::from_millis(self.bytes / FLUSH_BYTES_PER_MS));
        Ok(SyntheticSegment {
            num_docs: self.num_docs,
            bytes: self.bytes,
        })
    }
}

fn format_elapsed(duration: &time::Duration) -> String {
    let secs = duration.as_secs();
    let ms = duration.subsec_millis();
    if secs > 0 {
        format!("{}.{:03} secs", secs, ms)
    } else {
        format!("{} ms", ms)
    }
}

fn index(writer: &DocumentsWriter<SyntheticBuffer>, num_docs: usize) -> Result<()> {
    let mut rng = thread_rng();
    for i in 0..num_docs {
        let size = rng.gen_range(1024..64 * 1024);
        if i % 10 == 9 {
            writer.update_document(|b| {
                b.bytes += size;
                b.num_docs += 1;
                b.num_delete_terms += 1;
                Ok(())
            })?;
        } else {
            writer.add_document(|b| {
                b.bytes += size;
                b.num_docs += 1;
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn run(args: &[String]) -> Result<()> {
    let config = match args.get(1).map(|s| s.as_str()) {
        Some(path) if path != "-" => IndexWriterConfig::from_path(path)?,
        _ => IndexWriterConfig::default(),
    };
    let num_threads = match args.get(2) {
        Some(n) => n.parse()?,
        None => num_cpus::get(),
    };
    let docs_per_thread: usize = match args.get(3) {
        Some(n) => n.parse()?,
        None => 10_000,
    };
    println!("config: {:?}", &config);

    let writer = Arc::new(DocumentsWriter::<SyntheticBuffer>::new(
        config,
        Box::new(SyntheticBuffer::default),
    )?);

    let start = time::Instant::now();
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || index(&writer, docs_per_thread))
        })
        .collect();
    for h in handles {
        match h.join() {
            Ok(res) => res?,
            Err(_) => {
                eprintln!("indexing thread panicked");
                process::exit(1);
            }
        }
    }
    writer.flush_all_threads()?;
    let elapsed = start.elapsed();
    writer.close()?;

    let control = writer.flush_control();
    control.verify_accounting()?;
    let stats = control.stats()?;
    let segments = writer.take_flushed_segments();
    let flushed_bytes: u64 = segments.iter().map(|s| s.bytes).sum();
    let flushed_docs: u64 = segments.iter().map(|s| u64::from(s.num_docs)).sum();

    println!(
        "indexed {} docs with {} threads in {}",
        writer.num_docs(),
        num_threads,
        format_elapsed(&elapsed)
    );
    println!(
        "flushed {} segments, {} docs, {} bytes",
        segments.len(),
        flushed_docs,
        flushed_bytes
    );
    println!(
        "peak active {} bytes, peak flush {} bytes, peak net {} bytes, peak delta {} bytes",
        stats.peak_active_bytes, stats.peak_flush_bytes, stats.peak_net_bytes, stats.peak_delta
    );
    println!("stalled: {}", control.stall_control().was_stalled()?);
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!(
            "usage: {} [config.json|-] [threads] [docs_per_thread]",
            args[0]
        );
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
