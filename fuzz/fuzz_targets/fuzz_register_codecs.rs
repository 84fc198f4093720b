#![no_main]

use e32_link::codec::{ConfigRegister, VersionInfo};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(register) = ConfigRegister::parse(data) {
        // Every accepted register must re-encode to the bytes it came from.
        assert_eq!(&register.serialize()[..], data);
        let _ = register.to_string();
    }
    let _ = VersionInfo::parse(data);
});
