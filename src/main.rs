// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_resign::{
        Bundle, BundleSigner, DirectoryFileProvider, EmbeddedSignature, FatBinary,
        InMemoryCertificateStore, ProvisioningProfile, SigningCertificate, SigningConfig,
        SigningError,
    },
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
};

fn load_certificates(args: &ArgMatches) -> Result<InMemoryCertificateStore, SigningError> {
    let mut store = InMemoryCertificateStore::default();

    if let (Some(cert_path), Some(key_path)) =
        (args.value_of("pem_cert"), args.value_of("pem_key"))
    {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        store.add(SigningCertificate::from_pem_parts(&cert_pem, &key_pem)?);
    }

    if let Some(p12_path) = args.value_of("p12_file") {
        let data = std::fs::read(p12_path)?;
        let password = args.value_of("p12_password").unwrap_or("");
        store.add(SigningCertificate::from_pfx(&data, password)?);
    }

    if store.is_empty() {
        return Err(SigningError::NoSigningCertificate);
    }

    Ok(store)
}

fn command_sign(args: &ArgMatches) -> Result<(), SigningError> {
    let bundle_path = args.value_of("bundle").ok_or(SigningError::CliBadArgument)?;
    let profile_path = args
        .value_of("profile")
        .ok_or(SigningError::CliBadArgument)?;

    let store = load_certificates(args)?;
    let profile = ProvisioningProfile::from_bytes(&std::fs::read(profile_path)?)?;
    let bundle = Bundle::open(DirectoryFileProvider::new(bundle_path))?;

    let config = SigningConfig {
        bundle_id_override: args.value_of("bundle_id").map(|s| s.to_string()),
        team_id_override: args.value_of("team_id").map(|s| s.to_string()),
        entitlements_override_xml: match args.value_of("entitlements") {
            Some(path) => Some(String::from_utf8_lossy(&std::fs::read(path)?).into_owned()),
            None => None,
        },
        preserve_requirements: args.is_present("preserve_requirements"),
    };

    let mut signer = BundleSigner::new(bundle, profile, &store, config);
    signer.prepare()?;
    signer.sign()
}

fn command_print_signature(args: &ArgMatches) -> Result<(), SigningError> {
    let path = args.value_of("path").ok_or(SigningError::CliBadArgument)?;
    let data = std::fs::read(path)?;

    let fat = FatBinary::parse(&data)?;
    for (i, member) in fat.members.iter().enumerate() {
        println!(
            "image {} (cpu_type 0x{:x}) at offset 0x{:x}:",
            i, member.image.cpu_type, member.file_offset
        );

        let (sig_offset, sig_size) = match member.image.signature_region() {
            Ok(region) => region,
            Err(e) => {
                println!("  no signature region: {}", e);
                continue;
            }
        };

        let start = (member.file_offset + sig_offset) as usize;
        let region = data
            .get(start..start + sig_size as usize)
            .ok_or(SigningError::InputTruncated("signature region"))?;
        let signature = match EmbeddedSignature::from_bytes(region) {
            Ok(signature) => signature,
            Err(e) => {
                println!("  reserved region holds no signature: {}", e);
                continue;
            }
        };

        println!(
            "  superblob: {} bytes, {} blobs",
            signature.length, signature.count
        );
        for entry in &signature.blobs {
            println!(
                "  slot {:?}: {:?}, {} bytes at +0x{:x}",
                entry.slot, entry.magic, entry.length, entry.offset
            );
        }

        if let Some(cd) = signature.code_directory()? {
            println!("  code directory:");
            println!("    version: 0x{:x}", cd.version);
            println!("    identifier: {}", cd.ident);
            if let Some(team) = &cd.team_name {
                println!("    team: {}", team);
            }
            println!("    code limit: 0x{:x}", cd.code_limit);
            println!(
                "    digests: {} code pages + {} special slots",
                cd.code_digests.len(),
                cd.special_digests.len()
            );
        }

        if let Some(set) = signature.requirement_set()? {
            for (typ, requirement) in &set.requirements {
                println!("  {} requirement: {}", typ, requirement.parse_expressions()?);
            }
        }
    }

    Ok(())
}

fn main_impl() -> Result<(), SigningError> {
    let app = Command::new("Apple binary re-signing")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Re-sign compiled Apple executables without Apple's toolchain")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign an application bundle's main executable")
            .arg(
                Arg::new("bundle")
                    .required(true)
                    .help("Path to the bundle directory to sign"),
            )
            .arg(
                Arg::new("profile")
                    .long("profile")
                    .takes_value(true)
                    .required(true)
                    .help("Path to the provisioning profile to embed and sign against"),
            )
            .arg(
                Arg::new("pem_cert")
                    .long("pem-cert")
                    .takes_value(true)
                    .requires("pem_key")
                    .help("Path to a PEM encoded signing certificate"),
            )
            .arg(
                Arg::new("pem_key")
                    .long("pem-key")
                    .takes_value(true)
                    .help("Path to a PEM encoded PKCS#8 private key"),
            )
            .arg(
                Arg::new("p12_file")
                    .long("p12-file")
                    .takes_value(true)
                    .help("Path to a PKCS#12 (.p12) file holding certificate and key"),
            )
            .arg(
                Arg::new("p12_password")
                    .long("p12-password")
                    .takes_value(true)
                    .help("Password for the PKCS#12 file"),
            )
            .arg(
                Arg::new("entitlements")
                    .long("entitlements")
                    .takes_value(true)
                    .help("XML plist whose keys override profile entitlements"),
            )
            .arg(
                Arg::new("bundle_id")
                    .long("bundle-id")
                    .takes_value(true)
                    .help("Sign as this bundle identifier"),
            )
            .arg(
                Arg::new("team_id")
                    .long("team-id")
                    .takes_value(true)
                    .help("Team identifier to record in the code directory"),
            )
            .arg(
                Arg::new("preserve_requirements")
                    .long("preserve-requirements")
                    .help("Re-use the designated requirement from the existing signature"),
            ),
    );

    let app = app.subcommand(
        Command::new("print-signature")
            .about("Print the embedded signature of a Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to the Mach-O binary to inspect"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }
    builder.init();

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(args),
        Some(("print-signature", args)) => command_print_signature(args),
        _ => Err(SigningError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
