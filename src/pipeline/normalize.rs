//! Result normalizer: the only place an [`UpscaleResult`] is built.
//!
//! Both the immediate path and the polling path end here, so the
//! "completed implies a usable location" rule is enforced once.

use crate::error::FluxscaleError;
use crate::output::{ImageLocation, UpscaleResult};
use crate::pipeline::poll::{JobState, PollReport};
use image::ImageFormat;

/// Result for an image available straight from the upload response.
pub fn from_immediate(
    location: ImageLocation,
    format: ImageFormat,
) -> Result<UpscaleResult, FluxscaleError> {
    build(location, format, None)
}

/// Result for a job that completed while polling.
pub fn from_completed(
    job_id: &str,
    location: ImageLocation,
    format: ImageFormat,
) -> Result<UpscaleResult, FluxscaleError> {
    build(location, format, Some(job_id.to_string()))
}

/// Map a finished polling loop to a result or the matching error.
pub fn from_poll_report(
    report: PollReport,
    poll_timeout_secs: u64,
) -> Result<UpscaleResult, FluxscaleError> {
    let PollReport { job_id, state, .. } = report;
    match state {
        JobState::Completed { location, format } => from_completed(&job_id, location, format),
        JobState::Failed(message) => Err(FluxscaleError::JobFailed { job_id, message }),
        JobState::TimedOut => Err(FluxscaleError::PollTimeout {
            job_id,
            secs: poll_timeout_secs,
        }),
        JobState::Cancelled => Err(FluxscaleError::Cancelled),
    }
}

fn build(
    location: ImageLocation,
    format: ImageFormat,
    job_id: Option<String>,
) -> Result<UpscaleResult, FluxscaleError> {
    if location.is_empty() {
        return Err(FluxscaleError::NoUsableResult {
            body: format!("completed result has an empty location ({location:?})"),
        });
    }
    Ok(UpscaleResult::completed(location, format, job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn report(state: JobState) -> PollReport {
        PollReport {
            job_id: "job-9".into(),
            state,
            ticks: 3,
            elapsed: Duration::from_secs(6),
        }
    }

    #[test]
    fn empty_location_is_never_completed() {
        let err = from_immediate(ImageLocation::Remote(" ".into()), ImageFormat::Png).unwrap_err();
        assert!(matches!(err, FluxscaleError::NoUsableResult { .. }));
    }

    #[test]
    fn completed_report_keeps_job_id() {
        let result = from_poll_report(
            report(JobState::Completed {
                location: ImageLocation::Remote("https://cdn/r.png".into()),
                format: ImageFormat::Png,
            }),
            300,
        )
        .unwrap();
        assert!(result.is_completed());
        assert_eq!(result.job_id(), Some("job-9"));
        assert_eq!(result.location().remote_url(), Some("https://cdn/r.png"));
    }

    #[test]
    fn terminal_failures_map_to_errors() {
        assert!(matches!(
            from_poll_report(report(JobState::TimedOut), 300),
            Err(FluxscaleError::PollTimeout { secs: 300, .. })
        ));
        match from_poll_report(report(JobState::Failed("nsfw".into())), 300) {
            Err(FluxscaleError::JobFailed { job_id, message }) => {
                assert_eq!(job_id, "job-9");
                assert_eq!(message, "nsfw");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            from_poll_report(report(JobState::Cancelled), 300),
            Err(FluxscaleError::Cancelled)
        ));
    }
}
