//! Instance family tables: which EC2 families carry a given CPU generation
//! or GPU model.

const CPU_FAMILIES: &[(&str, &[&str])] = &[
    (
        "graviton-2",
        &["c6g", "c6gd", "c6gn", "m6g", "m6gd", "r6g", "r6gd", "t4g", "g5g"],
    ),
    (
        "graviton-3",
        &["c7g", "c7gd", "c7gn", "m7g", "m7gd", "r7g", "r7gd"],
    ),
    (
        "graviton-4",
        &["c8g", "c8gd", "c8gn", "m8g", "m8gd", "r8g", "r8gd"],
    ),
    ("epyc-gen-1", &["t3a"]),
    (
        "epyc-gen-2",
        &["c5a", "m5a", "r5a", "g4ad", "p4", "inf2", "g5"],
    ),
    ("epyc-gen-3", &["m6a", "c6a", "r6a", "p5"]),
    ("epyc-gen-4", &["c7a", "m7a", "r7a"]),
    (
        "xeon-gen-1",
        &["c4", "m4", "t2", "r4", "p3", "p2", "f1", "g3", "i3en"],
    ),
    (
        "xeon-gen-2",
        &[
            "c5", "c5n", "m5", "m5n", "m5zn", "r5", "t3", "t3n", "dl1", "inf1", "g4dn", "vt1",
        ],
    ),
    (
        "xeon-gen-3",
        &[
            "c6i", "c6in", "m6i", "m6in", "r6i", "r6id", "r6idn", "r6in", "trn1",
        ],
    ),
    ("xeon-gen-4", &["c7i", "m7i", "m7i-flex", "r7i", "r7iz"]),
    ("core-i7-mac", &["mac1"]),
];

const GPU_FAMILIES: &[(&str, &str)] = &[
    ("h100", "p5"),
    ("a100", "p4"),
    ("v100", "p3"),
    ("k80", "p2"),
    ("gaudi", "dl1"),
    ("trainium", "trn1"),
    ("inferentia2", "inf2"),
    ("inferentia1", "inf1"),
    ("t4g", "g5g"),
    ("a10g", "g5"),
    ("t4", "g4dn"),
    ("v520", "g4ad"),
    ("m60", "g3"),
    ("fpga", "f1"),
    ("u30", "vt1"),
];

/// Instance families carrying a CPU type, e.g. `graviton-3`.
pub fn cpu_families(cpu_type: &str) -> Option<&'static [&'static str]> {
    CPU_FAMILIES
        .iter()
        .find(|(cpu, _)| *cpu == cpu_type)
        .map(|(_, families)| *families)
}

/// The instance family offering a GPU model, e.g. `a10g` -> `g5`.
pub fn gpu_family(gpu_type: &str) -> Option<&'static str> {
    GPU_FAMILIES
        .iter()
        .find(|(gpu, _)| gpu.eq_ignore_ascii_case(gpu_type))
        .map(|(_, family)| *family)
}

/// The CPU type of an instance family.
pub fn cpu_of_family(family: &str) -> Option<&'static str> {
    CPU_FAMILIES
        .iter()
        .find(|(_, families)| families.contains(&family))
        .map(|(cpu, _)| *cpu)
}

pub fn cpu_types() -> impl Iterator<Item = &'static str> {
    CPU_FAMILIES.iter().map(|(cpu, _)| *cpu)
}

/// Instance family prefix of a type name: `c7g.4xlarge` -> `c7g`.
pub fn family_of(instance_type: &str) -> &str {
    instance_type
        .split_once('.')
        .map_or(instance_type, |(family, _)| family)
}

/// Whether `instance_type` belongs to one of `families` exactly.
///
/// `c6g.large` is in `c6g` but not in `c6`.
pub fn in_families(instance_type: &str, families: &[&str]) -> bool {
    families.contains(&family_of(instance_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_maps_to_family_and_cpu() {
        assert_eq!(gpu_family("a10g"), Some("g5"));
        assert_eq!(gpu_family("H100"), Some("p5"));
        assert_eq!(cpu_of_family("g5"), Some("epyc-gen-2"));
        assert_eq!(cpu_of_family("g4dn"), Some("xeon-gen-2"));
        assert_eq!(gpu_family("rtx4090"), None);
    }

    #[test]
    fn every_gpu_family_has_a_cpu() {
        for (gpu, family) in GPU_FAMILIES {
            assert!(cpu_of_family(family).is_some(), "{gpu} -> {family}");
        }
    }

    #[test]
    fn family_membership_is_exact() {
        let families = cpu_families("graviton-2").unwrap();
        assert!(in_families("c6g.large", families));
        assert!(in_families("c6gd.2xlarge", families));
        assert!(!in_families("c6i.large", families));
        assert!(!in_families("c6.large", families));
        assert_eq!(family_of("m7i-flex.large"), "m7i-flex");
    }

    #[test]
    fn unknown_cpu_type() {
        assert!(cpu_families("pentium").is_none());
        assert!(cpu_types().any(|c| c == "xeon-gen-4"));
    }
}
