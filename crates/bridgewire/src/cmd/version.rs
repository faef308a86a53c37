use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("bridgewire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: bridgewire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol_version: {}", bridgewire_frame::PROTOCOL_VERSION);
    println!(
        "native_abi_version: {}",
        bridgewire_transport::SUPPORTED_NATIVE_ABI_VERSION
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("BRIDGEWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "build_profile: {}",
        option_env!("BRIDGEWIRE_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "features: server={}, cli=true",
        cfg!(feature = "server")
    );

    Ok(SUCCESS)
}
