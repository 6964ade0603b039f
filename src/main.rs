use log::{debug, info};
use stackzone::error::fatal;
use stackzone::{
    MemoryConfig, MemoryError, MemoryZone, WordStack, ZoneKind, ZoneRegistry, MAX_REGISTERS,
};
use std::env;

const DEFAULT_FRAME_WORDS: usize = 8;

fn usage(program: &str) {
    println!("stackzone - word stacks and guarded memory zones");
    println!();
    println!(
        "Usage: {} [config.toml] [--exercise FRAMES] [--frame WORDS] [--print-config]",
        program
    );
    println!("Examples:");
    println!("  {}", program);
    println!("  {} memory.toml --exercise 100000", program);
    println!();
    println!("--exercise pushes FRAMES frames of WORDS words (default {})", DEFAULT_FRAME_WORDS);
    println!("on the deterministic stack under the configured overflow policy.");
}

fn parse_count(args: &[String], i: usize, flag: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let value = args
        .get(i)
        .ok_or_else(|| format!("{} needs a value", flag))?;
    Ok(value
        .parse::<usize>()
        .map_err(|_| format!("Invalid value for {}: {}", flag, value))?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config_path = None;
    let mut exercise = None;
    let mut frame_words = DEFAULT_FRAME_WORDS;
    let mut print_config = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                usage(&args[0]);
                return Ok(());
            }
            "--exercise" => {
                i += 1;
                exercise = Some(parse_count(&args, i, "--exercise")?);
            }
            "--frame" => {
                i += 1;
                frame_words = parse_count(&args, i, "--frame")?.max(1);
            }
            "--print-config" => print_config = true,
            path => config_path = Some(path.to_string()),
        }
        i += 1;
    }

    let config = match &config_path {
        Some(path) => MemoryConfig::load(path)?,
        None => MemoryConfig::default(),
    };
    if print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let mut registry = match ZoneRegistry::init_memory(config) {
        Ok(registry) => registry,
        Err(e) if e.is_fatal() => fatal(&e),
        Err(e) => return Err(e.into()),
    };
    info!("memory map:\n{}", registry);

    if let Some(frames) = exercise {
        match run_exercise(&mut registry, frames, frame_words) {
            Ok(()) => println!("pushed {} frames of {} words", frames, frame_words),
            Err(e @ MemoryError::StackExhausted { .. }) => {
                eprintln!("Error: {}", e);
                println!("{}", registry);
                std::process::exit(1);
            }
            Err(e) if e.is_fatal() => fatal(&e),
            Err(e) => return Err(e.into()),
        }
    }

    println!("{}", registry);
    registry.shutdown();
    Ok(())
}

// Push `frames` frames on the detstack, recording each frame's base on an
// operand stack, then unwind them and check their contents.
fn run_exercise(
    registry: &mut ZoneRegistry,
    frames: usize,
    frame_words: usize,
) -> Result<(), MemoryError> {
    let mut operands = registry.new_word_stack();
    let mut top = registry.zone(ZoneKind::DetStack).map_or(0, |z| z.min());

    for n in 0..frames {
        let block = registry.claim(ZoneKind::DetStack, top, frame_words)?;
        if let Some(zone) = registry.zone_mut(ZoneKind::DetStack) {
            for (k, word) in zone.slice_mut(block.clone()).iter_mut().enumerate() {
                *word = n ^ k;
            }
        }
        let slot = operands.alloc(2);
        operands.poke(slot, block.start);
        operands.poke_rel(1, n);
        registry.registers_mut().note_use(n % MAX_REGISTERS);
        top = block.end;
    }
    debug!(
        "exercise reached depth {} ({} operand words)",
        top,
        operands.size()
    );

    if let Some(zone) = registry.zone(ZoneKind::DetStack) {
        unwind_frames(zone, &mut operands, frame_words)?;
    }
    operands.delete();
    Ok(())
}

// Pop (base, n) pairs off the operand stack and check each frame still holds
// the words `n ^ k` written when it was pushed.
fn unwind_frames(
    zone: &MemoryZone,
    operands: &mut WordStack,
    frame_words: usize,
) -> Result<(), MemoryError> {
    while !operands.is_empty() {
        let n = operands.pop();
        let base = operands.pop();
        for k in 0..frame_words {
            if zone.read(base + k) != n ^ k {
                return Err(MemoryError::Corrupted {
                    zone: zone.kind(),
                    address: base + k,
                });
            }
        }
    }
    Ok(())
}
