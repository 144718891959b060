#![no_main]

use bincode::config::{Configuration, Fixint, LittleEndian};
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use region_heap_fuzzing::Ops;

/// Sixteen pages: enough for long split/coalesce chains, small enough that
/// large requests still run out of memory.
const HEAP_SIZE: usize = 1 << 16;

type Config = Configuration<LittleEndian, Fixint>;

const CONFIG: Config = bincode::config::standard()
    .with_little_endian()
    .with_fixed_int_encoding();

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice(data, CONFIG)
        .ok()
        .map(|(ops, _)| ops)
}

/// Encode `ops` into `buf`, dropping trailing ops until it fits.
fn encode_truncating(ops: &mut Ops, buf: &mut [u8]) -> Option<usize> {
    loop {
        match bincode::encode_into_slice(&*ops, &mut *buf, CONFIG) {
            Ok(len) => return Some(len),
            Err(_) if ops.pop() => continue,
            Err(_) => return None,
        }
    }
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave some raw byte-level mutation in the mix.
    if seed % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    encode_truncating(&mut ops, &mut data[..max_size])
        .unwrap_or_else(|| fuzzer_mutate(data, size, max_size))
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = decode(data) else {
        return;
    };
    if let Err(e) = ops.run(HEAP_SIZE) {
        panic!("heap check failed: {e}\n{ops:#?}");
    }
});
