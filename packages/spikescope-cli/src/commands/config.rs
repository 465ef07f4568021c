use crate::cli::ConfigArgs;
use crate::exit_codes;
use crate::output;
use spikescope::PipelineConfig;

pub fn execute(args: ConfigArgs) -> i32 {
    if output::emit(
        &PipelineConfig::default(),
        args.compact,
        args.output.as_deref(),
    ) {
        exit_codes::SUCCESS
    } else {
        exit_codes::EXECUTION_ERROR
    }
}
