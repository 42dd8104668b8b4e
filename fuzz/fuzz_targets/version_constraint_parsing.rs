#![no_main]
use libfuzzer_sys::fuzz_target;
use native_loader::module::resolver::{ModuleVersion, VersionConstraint};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Version strings that parse must print back to something that parses equal
    if let Ok(version) = ModuleVersion::parse(text) {
        let reparsed = ModuleVersion::parse(&version.to_string()).expect("printed version parses");
        assert_eq!(reparsed, version);
    }

    // Constraint parsing should never panic; satisfaction is total
    if let Ok(constraint) = VersionConstraint::parse(text) {
        let _ = constraint.satisfies(&ModuleVersion::new(1, 0, 0));
        let _ = constraint.satisfies(&ModuleVersion::new(0, 0, 0));
    }
});
