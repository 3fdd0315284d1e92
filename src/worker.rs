use crate::{
    error::{Result, ScanError},
    prefix_scan::{ScanOutput, Scanner},
    request::Request,
    segment::{SegmentStore, Status},
};

/// Serves one request: attach, scan, publish, detach.
///
/// Runs on a blocking thread. Any error leaves the segment's status where it
/// was; the caller is responsible for logging it.
pub fn serve(store: &SegmentStore, scanner: &dyn Scanner, request: Request) -> Result<ScanOutput> {
    let attachment = store.attach(request.requester_id)?;

    let declared = attachment.element_count();
    if declared != request.element_count {
        attachment.detach();
        return Err(ScanError::input(format!(
            "request declares {} values, segment holds {declared}",
            request.element_count
        )));
    }

    let status = attachment.status()?;
    if status != Status::DataReady {
        attachment.detach();
        return Err(ScanError::WrongStatus {
            expected: Status::DataReady,
            actual: status,
        });
    }

    let result = scanner.scan_segment(request.operation, &attachment);
    attachment.detach();
    let output = result?;

    tracing::info!(
        requester = %request.requester_id,
        op = %request.operation,
        n = request.element_count,
        stages = output.stages,
        "result published"
    );

    Ok(output)
}
