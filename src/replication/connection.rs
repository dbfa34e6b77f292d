//! Safe wrapper around libpq for replication-mode connections.

use crate::errors::{CdcError, CdcResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::ptr;

/// Thin safe wrapper over a `PGconn`, used in replication mode.
pub struct PGConnection {
    conn: *mut PGconn,
}

// libpq connections are not implicitly thread-safe, but we only ever touch
// this handle from the single blocking task that owns the consumer loop.
unsafe impl Send for PGConnection {}

impl PGConnection {
    pub fn connect(conninfo: &str) -> CdcResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(CdcError::connection("failed to allocate connection object"));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or_else(|| "unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(CdcError::connection(format!("connection failed: {}", error_msg)));
        }

        Ok(Self { conn })
    }

    pub fn exec(&self, query: &str) -> CdcResult<PGResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let error_msg = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(CdcError::protocol(format!("query execution failed: {}", error_msg)));
        }

        Ok(PGResult { result })
    }

    /// Reads one row from a COPY BOTH stream, blocking until data or the
    /// protocol-level end arrives. `None` means the COPY is complete.
    pub fn get_copy_data(&self) -> CdcResult<Option<Vec<u8>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 0) };

        match copy_data_len {
            -2 => {
                let error_msg = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(CdcError::protocol(error_msg))
            }
            -1 => {
                let result = PGResult { result: unsafe { PQgetResult(self.conn) } };
                if !result.is_ok() {
                    let error_msg = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                    return Err(CdcError::protocol(error_msg));
                }
                Ok(None)
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(CdcError::buffer("received null copy buffer"));
                }
                let data = unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    /// Non-blocking poll of a COPY BOTH stream. `Ok(None)` means no row is
    /// available yet (keep polling); `Ok(Some(None))` means the COPY
    /// finished; `Ok(Some(Some(bytes)))` is a row of data.
    pub fn poll_copy_data(&self) -> CdcResult<Option<Option<Vec<u8>>>> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match copy_data_len {
            -2 => {
                let error_msg = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
                Err(CdcError::protocol(error_msg))
            }
            -1 => Ok(Some(None)),
            0 => {
                unsafe { PQconsumeInput(self.conn) };
                Ok(None)
            }
            len => {
                if buffer.is_null() {
                    return Err(CdcError::buffer("received null copy buffer"));
                }
                let data = unsafe { std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(Some(data)))
            }
        }
    }

    pub fn put_copy_data(&self, data: &[u8]) -> CdcResult<()> {
        let result = unsafe {
            PQputCopyData(self.conn, data.as_ptr() as *const std::os::raw::c_char, data.len() as i32)
        };

        if result != 1 {
            let error_msg = get_error_message(self.conn).unwrap_or_else(|| "unknown error".to_string());
            return Err(CdcError::protocol(format!("failed to send copy data: {}", error_msg)));
        }

        Ok(())
    }

    pub fn flush(&self) -> CdcResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(CdcError::protocol("failed to flush connection"));
        }
        Ok(())
    }
}

impl Drop for PGConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned())
        }
    }
}

/// Safe wrapper for a `PGresult`.
pub struct PGResult {
    result: *mut PGresult,
}

impl PGResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status(), ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK)
    }

    pub fn copy_both(&self) -> bool {
        self.status() == ExecStatusType::PGRES_COPY_BOTH
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PGResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
