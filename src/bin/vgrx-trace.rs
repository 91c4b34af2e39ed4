// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Register trace driver
//!
//! Replays a textual register/LFB/texture access trace against a chip
//! instance and optionally dumps the resulting front buffer as a PPM
//! image. Trace lines are one access each:
//!
//! ```text
//! # comment
//! reg 0x0110 0x00000200
//! lfb 0x0000 0xf800f800
//! tex 0 0x0000 0xdeadbeef
//! ```
//!
//! Offsets and data are hex; `tex` takes the TMU index first.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use vgrx::backend::readback::expand_565;
use vgrx::core::chip::{Voodoo, VoodooConfig};
use vgrx::core::error::{ChipError, Result};

#[derive(Parser)]
#[command(name = "vgrx-trace", about = "Replay a register trace against the chip model")]
struct Args {
    /// Trace file to replay
    trace: PathBuf,

    /// Frame buffer width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame buffer height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Number of texture units
    #[arg(long, default_value_t = 2)]
    tmus: usize,

    /// Rasterization worker threads (0 = auto)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Write the final front buffer as a binary PPM
    #[arg(long)]
    frame_out: Option<PathBuf>,

    /// Print pixel statistics after the replay
    #[arg(long)]
    stats: bool,
}

/// One parsed trace access
#[derive(Debug)]
enum Access {
    Register { offset: u32, data: u32 },
    Lfb { offset: u32, data: u32 },
    Texture { tmu: usize, offset: u32, data: u32 },
}

fn parse_hex(token: &str, line: usize) -> Result<u32> {
    let trimmed = token.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).map_err(|_| ChipError::TraceParse {
        line,
        message: format!("expected hex value, got {token:?}"),
    })
}

fn parse_line(text: &str, line: usize) -> Result<Option<Access>> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }
    let mut tokens = text.split_whitespace();
    let kind = tokens.next().unwrap_or_default();
    let access = match kind {
        "reg" | "lfb" => {
            let offset = parse_hex(next_token(&mut tokens, line)?, line)?;
            let data = parse_hex(next_token(&mut tokens, line)?, line)?;
            if kind == "reg" {
                Access::Register { offset, data }
            } else {
                Access::Lfb { offset, data }
            }
        }
        "tex" => {
            let tmu = next_token(&mut tokens, line)?
                .parse::<usize>()
                .map_err(|_| ChipError::TraceParse {
                    line,
                    message: "expected TMU index".into(),
                })?;
            let offset = parse_hex(next_token(&mut tokens, line)?, line)?;
            let data = parse_hex(next_token(&mut tokens, line)?, line)?;
            Access::Texture { tmu, offset, data }
        }
        other => {
            return Err(ChipError::TraceParse {
                line,
                message: format!("unknown access kind {other:?}"),
            })
        }
    };
    if tokens.next().is_some() {
        return Err(ChipError::TraceParse {
            line,
            message: "trailing tokens".into(),
        });
    }
    Ok(Some(access))
}

fn next_token<'a>(tokens: &mut impl Iterator<Item = &'a str>, line: usize) -> Result<&'a str> {
    tokens.next().ok_or_else(|| ChipError::TraceParse {
        line,
        message: "missing field".into(),
    })
}

fn replay(chip: &mut Voodoo, trace: &str) -> Result<u64> {
    let mut count = 0u64;
    for (index, text) in trace.lines().enumerate() {
        if let Some(access) = parse_line(text, index + 1)? {
            match access {
                Access::Register { offset, data } => chip.register_write(offset, data),
                Access::Lfb { offset, data } => chip.lfb_write(offset, data),
                Access::Texture { tmu, offset, data } => chip.texture_write(tmu, offset, data),
            }
            count += 1;
        }
    }
    Ok(count)
}

/// Dump the front buffer as a binary PPM (565 expanded to 8-bit RGB)
fn dump_frame(chip: &Voodoo, path: &PathBuf) -> Result<()> {
    let fbi = chip.fbi();
    let (width, height) = (fbi.width(), fbi.height());
    let base = fbi.rgb_offset(fbi.front_index());
    let row = fbi.row_pixels();

    let mut out = Vec::with_capacity((width * height * 3 + 32) as usize);
    write!(out, "P6\n{width} {height}\n255\n")?;
    for y in 0..height {
        for x in 0..width {
            let rgba = expand_565(fbi.read_pixel(base + y * row + x));
            out.extend_from_slice(&rgba[..3]);
        }
    }
    fs::write(path, out)?;
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let config = VoodooConfig {
        width: args.width,
        height: args.height,
        tmu_count: args.tmus,
        workers: args.workers,
        ..VoodooConfig::default()
    };
    config.validate()?;
    let mut chip = Voodoo::new(config);

    let trace = fs::read_to_string(&args.trace)?;
    let count = replay(&mut chip, &trace)?;
    log::info!("replayed {count} accesses, {} triangles", chip.triangle_count());

    if args.stats {
        let stats = chip.stats();
        println!("pixels in:    {}", stats.pixels_in);
        println!("pixels out:   {}", stats.pixels_out);
        println!("chroma fail:  {}", stats.chroma_fail);
        println!("zfunc fail:   {}", stats.zfunc_fail);
        println!("afunc fail:   {}", stats.afunc_fail);
    }

    if let Some(path) = &args.frame_out {
        dump_frame(&chip, path)?;
        log::info!("wrote frame to {}", path.display());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("vgrx-trace: {err}");
        std::process::exit(1);
    }
}
