// SPDX-License-Identifier: GPL-3.0-only

//! Shared D-Bus call helper for raw UDisks2 methods.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use zbus::{
    Connection, Proxy,
    zvariant::{DynamicType, OwnedObjectPath, Type},
};

/// Call a raw UDisks2 method with typed arguments and response,
/// unwrapping method errors into readable messages.
pub(crate) async fn call_udisks_raw<R, B>(
    connection: &Connection,
    path: &OwnedObjectPath,
    interface: &str,
    method: &str,
    args: &B,
) -> Result<R>
where
    R: DeserializeOwned + Type,
    B: Serialize + DynamicType,
{
    let proxy = Proxy::new(connection, "org.freedesktop.UDisks2", path, interface).await?;

    match proxy.call_method(method, args).await {
        Ok(reply) => Ok(reply.body().deserialize()?),
        Err(err) => {
            if let zbus::Error::MethodError(name, msg, _info) = &err {
                let msg = msg.as_deref().unwrap_or("");
                anyhow::bail!(
                    "UDisks2 {interface}.{method} failed for {path}: {}{}{}",
                    name.as_str(),
                    if msg.is_empty() { "" } else { ": " },
                    msg
                );
            }
            Err(err.into())
        }
    }
}
