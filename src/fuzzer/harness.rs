//! The isolated replay worker and its pipe protocol.
//!
//! The worker runs in its own process so a fault in the target library can
//! never take down the engine. It receives one serialized trace on its
//! incoming pipe, loads the target library, and replays every captured
//! call in order. Before each call it emits a single ping frame on its
//! outgoing pipe; the supervising monitor counts pings to pinpoint the
//! snapshot a crash or hang belongs to.

use std::io::{Read, Write};

use libloading::Library;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::options::{CallConvention, MorpherOptions};
use crate::trace::Trace;
use crate::Error;

/// The single byte a worker sends before every call.
pub const PING: u8 = 1;

/// Writes one length-prefixed bincode frame.
pub fn send_frame<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<(), Error> {
    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::serialize("frame exceeds the 4 GiB pipe limit"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T, Error> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Worker entry point: receive a trace, load the target, replay each call.
pub fn run_worker<R: Read, W: Write>(
    options: &MorpherOptions,
    trace_in: &mut R,
    ping_out: &mut W,
) -> Result<(), Error> {
    log::info!("replay worker is running, waiting for trace");
    let mut trace: Trace = read_frame(trace_in)?;

    let library = unsafe { Library::new(&options.target) }?;
    log::info!(
        "loaded {}, replaying {} calls",
        options.target.display(),
        trace.len()
    );
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("received trace:\n\n{trace}\n");
    }

    for call in trace.replay() {
        let (name, args) = call?;
        log::info!("calling function {name}");
        send_frame(ping_out, &PING)?;
        let mut words = Vec::new();
        for arg in &args {
            words.extend(arg.stack_words());
        }
        let result = unsafe { invoke(&library, &name, &words, options.dll_type)? };
        log::info!("function {name} returned {result:#x}");
    }
    log::info!("replay complete, worker shutting down");
    Ok(())
}

/// Redirects the process-level stdout/stderr to the null device and hands
/// back private handles to the original descriptors.
///
/// The target library inherits the redirected descriptors, so whatever it
/// prints cannot corrupt the ping pipe or the worker's diagnostics. The
/// returned pair is `(saved stdout, saved stderr)`: pings keep flowing
/// through the first, the log writer should be pointed at the second.
#[cfg(unix)]
pub fn silence_target_output() -> Result<(std::fs::File, std::fs::File), Error> {
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::{AsRawFd, FromRawFd};

    use nix::unistd::{dup, dup2};

    let to_io = |e: nix::Error| std::io::Error::from_raw_os_error(e as i32);
    let saved_out = dup(1).map_err(|e| Error::file(to_io(e), "could not save stdout"))?;
    let saved_err = dup(2).map_err(|e| Error::file(to_io(e), "could not save stderr"))?;
    let devnull = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .map_err(|e| Error::file(e, "could not open the null device"))?;
    dup2(devnull.as_raw_fd(), 1).map_err(|e| Error::file(to_io(e), "could not redirect stdout"))?;
    dup2(devnull.as_raw_fd(), 2).map_err(|e| Error::file(to_io(e), "could not redirect stderr"))?;
    Ok(unsafe { (File::from_raw_fd(saved_out), File::from_raw_fd(saved_err)) })
}

/// Fallback for platforms without descriptor-level redirection.
#[cfg(not(unix))]
pub fn silence_target_output() -> Result<(std::fs::File, std::fs::File), Error> {
    Err(Error::unsupported(
        "output redirection is not implemented on this platform",
    ))
}

// Every argument is lowered to whole stack words, so a call reduces to
// dispatching on the word count regardless of the original signature.
macro_rules! call_words {
    ($abi:tt, $lib:expr, $name:expr, $words:expr) => {{
        let name = $name.as_bytes();
        let w = $words;
        match w.len() {
            0 => ($lib.get::<unsafe extern $abi fn() -> usize>(name)?)(),
            1 => ($lib.get::<unsafe extern $abi fn(usize) -> usize>(name)?)(w[0]),
            2 => ($lib.get::<unsafe extern $abi fn(usize, usize) -> usize>(name)?)(w[0], w[1]),
            3 => ($lib.get::<unsafe extern $abi fn(usize, usize, usize) -> usize>(name)?)(
                w[0], w[1], w[2],
            ),
            4 => ($lib
                .get::<unsafe extern $abi fn(usize, usize, usize, usize) -> usize>(name)?)(
                w[0], w[1], w[2], w[3],
            ),
            5 => ($lib
                .get::<unsafe extern $abi fn(usize, usize, usize, usize, usize) -> usize>(
                    name,
                )?)(w[0], w[1], w[2], w[3], w[4]),
            6 => ($lib
                .get::<unsafe extern $abi fn(usize, usize, usize, usize, usize, usize) -> usize>(
                    name,
                )?)(w[0], w[1], w[2], w[3], w[4], w[5]),
            7 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6],
            ),
            8 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize, usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7],
            ),
            9 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize, usize, usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8],
            ),
            10 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize, usize, usize, usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8], w[9],
            ),
            11 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize, usize, usize, usize, usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8], w[9], w[10],
            ),
            12 => ($lib
                .get::<unsafe extern $abi fn(
                    usize, usize, usize, usize, usize, usize, usize, usize, usize, usize, usize,
                    usize,
                ) -> usize>(name)?)(
                w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8], w[9], w[10], w[11],
            ),
            n => {
                return Err(Error::illegal_argument(format!(
                    "call with {n} stack words is not supported"
                )))
            }
        }
    }};
}

/// Resolves `name` in the loaded library and calls it with the flattened
/// stack words.
///
/// # Safety
///
/// The words must describe a call the target function actually accepts;
/// this is exactly the contract the captured trace embodies.
pub unsafe fn invoke(
    library: &Library,
    name: &str,
    words: &[usize],
    convention: CallConvention,
) -> Result<usize, Error> {
    match convention {
        CallConvention::Cdecl => Ok(call_words!("C", library, name, words)),
        CallConvention::Stdcall => invoke_stdcall(library, name, words),
    }
}

#[cfg(target_arch = "x86")]
unsafe fn invoke_stdcall(library: &Library, name: &str, words: &[usize]) -> Result<usize, Error> {
    Ok(call_words!("stdcall", library, name, words))
}

#[cfg(not(target_arch = "x86"))]
unsafe fn invoke_stdcall(library: &Library, name: &str, words: &[usize]) -> Result<usize, Error> {
    log::warn!("stdcall is x86-only; falling back to the C convention");
    Ok(call_words!("C", library, name, words))
}

#[cfg(test)]
mod tests {
    use super::{read_frame, send_frame, PING};

    #[test]
    fn frame_round_trip() {
        let mut pipe = Vec::new();
        send_frame(&mut pipe, &vec![1u32, 2, 3]).unwrap();
        send_frame(&mut pipe, &PING).unwrap();

        let mut reader = pipe.as_slice();
        let first: Vec<u32> = read_frame(&mut reader).unwrap();
        let second: u8 = read_frame(&mut reader).unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, PING);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut pipe = Vec::new();
        send_frame(&mut pipe, &42u64).unwrap();
        pipe.truncate(pipe.len() - 1);
        let mut reader = pipe.as_slice();
        assert!(read_frame::<u64, _>(&mut reader).is_err());
    }
}
