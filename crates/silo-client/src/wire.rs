//! Reply-parsing helpers shared by the client modules.

use crate::Error;
use silo_message::{Code, Message};

/// Read one per-operation status. `Ok` means the operation's result
/// parameters follow in the payload; any other code is followed by a
/// diagnostic string and maps back into the typed error record.
pub(crate) fn read_status(reply: &mut Message) -> Result<(), Error> {
    let code = Code::from(reply.get_u32()?);
    if code.is_ok() {
        return Ok(());
    }
    let message = reply.get_string()?;
    Err(Error::from_wire(code, message))
}
