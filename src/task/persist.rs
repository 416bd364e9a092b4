use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Payload;
use crate::data::{Data, DataSet};
use crate::error::CacheError;
use crate::meta::Meta;
use crate::name::Name;

#[derive(Serialize, Deserialize)]
struct Stored<T> {
    meta: Meta,
    items: Vec<StoredItem<T>>,
}

#[derive(Serialize, Deserialize)]
struct StoredItem<T> {
    name: Name,
    meta: Meta,
    value: T,
}

/// Reads a data set written by [`write_behind`]. A missing file is `None`.
pub(crate) fn load<T>(path: &Utf8Path) -> Result<Option<DataSet<T>>, CacheError>
where
    T: Payload + DeserializeOwned,
{
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let stored: Stored<T> = ciborium::from_reader(std::io::BufReader::new(file))
        .map_err(|e| CacheError::Decode(e.to_string()))?;

    let mut builder = DataSet::builder();
    builder.meta(stored.meta);
    for item in stored.items {
        builder
            .add(item.name, Data::value(item.value).with_meta(item.meta))
            .map_err(|e| CacheError::Decode(e.to_string()))?;
    }

    Ok(Some(builder.build()))
}

fn save<T: Serialize>(path: &Utf8Path, stored: &Stored<T>) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Write to a sibling first so readers never see a partial file.
    let partial = path.with_extension("partial");
    let mut writer = std::io::BufWriter::new(fs::File::create(&partial)?);
    ciborium::into_writer(stored, &mut writer).map_err(|e| CacheError::Encode(e.to_string()))?;
    writer.flush()?;
    fs::rename(&partial, path)?;

    Ok(())
}

/// Writes `set` to `path` once every item completed. Nothing is started,
/// the file appears only if a caller evaluates the whole set. Failed items
/// or write errors leave no file behind.
pub(crate) fn write_behind<T>(set: &DataSet<T>, path: Utf8PathBuf)
where
    T: Payload + Serialize,
{
    if set.is_empty() {
        let stored: Stored<T> = Stored {
            meta: set.meta().clone(),
            items: vec![],
        };
        if let Err(error) = save(&path, &stored) {
            tracing::warn!(%path, %error, "couldn't persist task result");
        }
        return;
    }

    let remaining = Arc::new(AtomicUsize::new(set.len()));

    for (_, data) in set.iter() {
        let remaining = Arc::clone(&remaining);
        let set = set.clone();
        let path = path.clone();

        data.goal().on_complete(move |result| {
            // A failed item keeps the count above zero.
            if result.is_err() {
                return;
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }

            let mut items = Vec::with_capacity(set.len());
            for (name, data) in set.iter() {
                let Some(Ok(value)) = data.goal().try_get() else {
                    return;
                };
                items.push(StoredItem {
                    name: name.clone(),
                    meta: data.meta().clone(),
                    value,
                });
            }

            let stored = Stored {
                meta: set.meta().clone(),
                items,
            };

            match save(&path, &stored) {
                Ok(()) => tracing::debug!(%path, "persisted task result"),
                Err(error) => tracing::warn!(%path, %error, "couldn't persist task result"),
            }
        });
    }
}
