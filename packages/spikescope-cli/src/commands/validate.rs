use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use spikescope::{PipelineConfig, SignalFormat};

#[derive(Serialize)]
struct ValidateOutput {
    config: String,
    valid: bool,
    format: Option<SignalFormat>,
    buffer_size: Option<usize>,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs) -> i32 {
    let loaded = PipelineConfig::from_path(&args.config).and_then(|config| {
        config.validate()?;
        Ok(config)
    });

    let result = match &loaded {
        Ok(config) => ValidateOutput {
            config: args.config.clone(),
            valid: true,
            format: Some(config.format()),
            buffer_size: Some(config.buffer_size_for(config.format())),
            error: None,
        },
        Err(e) => ValidateOutput {
            config: args.config.clone(),
            valid: false,
            format: None,
            buffer_size: None,
            error: Some(e.to_string()),
        },
    };

    if args.json {
        if !output::emit(&result, false, None) {
            return exit_codes::EXECUTION_ERROR;
        }
    } else if let Some(ref err) = result.error {
        eprintln!("Error: {}", err);
    } else if let (Some(format), Some(size)) = (result.format, result.buffer_size) {
        println!(
            "Config '{}' is valid ({} channels @ {} Hz, {} samples per channel)",
            args.config, format.channel_count, format.sample_rate, size
        );
    }

    if result.valid {
        exit_codes::SUCCESS
    } else {
        exit_codes::INPUT_ERROR
    }
}
