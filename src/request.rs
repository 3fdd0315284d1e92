use crate::{
    error::{Result, ScanError},
    operation::Operation,
    segment::{RequesterId, MAX_ELEMENTS},
};

/// The request as it travels through the channel: three native-endian `i32`s.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RequestRecord {
    pub requester_id: i32,
    pub element_count: i32,
    pub operation: i32,
}

pub const RECORD_SIZE: usize = std::mem::size_of::<RequestRecord>();

impl RequestRecord {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }
}

/// A validated request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub requester_id: RequesterId,
    pub element_count: usize,
    pub operation: Operation,
}

impl Request {
    pub fn new(requester_id: RequesterId, element_count: usize, operation: Operation) -> Result<Self> {
        if element_count == 0 || element_count > MAX_ELEMENTS {
            return Err(ScanError::input(format!(
                "element count {element_count} outside 1..={MAX_ELEMENTS}"
            )));
        }
        Ok(Self {
            requester_id,
            element_count,
            operation,
        })
    }

    pub fn to_record(&self) -> RequestRecord {
        RequestRecord {
            requester_id: self.requester_id.0,
            element_count: self.element_count as i32,
            operation: self.operation.code(),
        }
    }
}

impl TryFrom<RequestRecord> for Request {
    type Error = ScanError;

    fn try_from(record: RequestRecord) -> Result<Self> {
        let count = usize::try_from(record.element_count)
            .map_err(|_| ScanError::input(format!("negative element count {}", record.element_count)))?;
        Request::new(
            RequesterId(record.requester_id),
            count,
            Operation::from_code(record.operation)?,
        )
    }
}
