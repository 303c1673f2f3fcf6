//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for
//! parsing, validating, and working with .torrent file metadata.
use crate::bencode::{self, BencodeValue};

use super::TorrentError;
use super::TorrentResult;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

# Torrent Protocol Context:
The `pieces` key within the `info` dictionary is a single string (byte
sequence) that is a concatenation of 20-byte SHA-1 hashes for each piece of
the torrent. This function breaks that long string into individual 20-byte
hash arrays. The order of these hashes is crucial as it corresponds directly
to the piece index.
*/
#[tracing::instrument(level = "trace", skip(pieces_bytes))]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(chunk);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/**
Parses the announce list from the torrent file.

The field is a list of tiers, each tier a list of tracker URL strings.
Every URL must be valid UTF-8.
*/
fn parse_announce_list(value: BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = match value {
        BencodeValue::List(tiers) => tiers,
        _ => {
            return Err(TorrentError::InvalidFormat(
                "Announce-list not a list".to_string(),
            ));
        }
    };

    let mut result = Vec::new();
    for tier in tiers {
        let trackers = match tier {
            BencodeValue::List(trackers) => trackers,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Announce tier not a list".to_string(),
                ));
            }
        };
        let mut tier_vec = Vec::new();
        for tracker in trackers {
            match tracker {
                BencodeValue::String(s) => {
                    tier_vec.push(String::from_utf8(s).map_err(|e| {
                        TorrentError::InvalidFormat(format!(
                            "Invalid tracker URL (not UTF-8): {}",
                            e
                        ))
                    })?);
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Tracker URL not a string".to_string(),
                    ));
                }
            }
        }
        result.push(tier_vec);
    }
    Ok(result)
}

/**
Parses the info dictionary from the torrent file.

Extracts `piece length`, `pieces`, `private`, `name`, the single-file
`length`, and the multi-file `files` list, validating the structure and
content of each field.
*/
fn parse_info_dict(value: &BencodeValue) -> TorrentResult<InfoDict> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::InvalidFormat("Info is not a dictionary".to_string()))?;

    let piece_length = match dict.get(b"piece length") {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let pieces_bytes = match dict.get(b"pieces") {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = matches!(dict.get(b"private"), Some(BencodeValue::Integer(1)));

    let name = match dict.get(b"name") {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(b"length") {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    let files = match dict.get(b"files") {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                let file_dict = file_val.as_dict().ok_or_else(|| {
                    TorrentError::InvalidFormat("File entry not a dict".to_string())
                })?;

                let length = match file_dict.get(b"length") {
                    Some(BencodeValue::Integer(i)) if *i >= 0 => *i,
                    _ => return Err(TorrentError::MissingField("file length".to_string())),
                };

                let path = match file_dict.get(b"path") {
                    Some(BencodeValue::List(path_list)) => {
                        let mut path_vec = Vec::new();
                        for p in path_list {
                            match p {
                                BencodeValue::String(s) => {
                                    path_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                                        TorrentError::InvalidFormat(format!(
                                            "Invalid file path (not UTF-8): {}",
                                            e
                                        ))
                                    })?);
                                }
                                _ => {
                                    return Err(TorrentError::InvalidFormat(
                                        "File path component not a string".to_string(),
                                    ));
                                }
                            }
                        }
                        path_vec
                    }
                    _ => return Err(TorrentError::MissingField("file path".to_string())),
                };

                files_vec.push(FileDict { length, path });
            }
            files_vec
        }
        _ => Vec::new(), // No files list means single-file torrent
    };

    let is_directory = !files.is_empty();

    if !is_directory && length.is_none() {
        return Err(TorrentError::MissingField("length or files".to_string()));
    }

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /// Decodes and parses a raw `.torrent` byte buffer.
    pub fn from_bytes(data: &[u8]) -> TorrentResult<TorrentFile> {
        let value = bencode::decode(data)?;
        Self::parse(value)
    }

    /**
    Parses the torrent file data into a `TorrentFile` struct.

    # How it works:
    1. Extracts the `announce`, `info`, `announce-list`, `creation date`,
       `comment`, `created by`, and `encoding` fields.
    2. Validates the structure and content of each field, including the
       agreement between the summed file lengths and the piece count.
    3. Calculates the `info_hash` and `pieces_hash`.
    */
    #[tracing::instrument(level = "debug", skip(data))]
    pub fn parse(data: BencodeValue) -> TorrentResult<TorrentFile> {
        let mut dict = match data {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Root is not a dictionary".to_string(),
                ));
            }
        };

        let announce = match dict.remove(b"announce") {
            Some(BencodeValue::String(s)) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce Url (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce".to_string())),
        };

        let info_dict_value = dict
            .remove(b"info")
            .ok_or(TorrentError::MissingField("info".to_string()))?;

        let info_hash = match &info_dict_value {
            BencodeValue::Dict(d) => super::info_hash::calculate_info_hash(d),
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "info is not a dict".to_string(),
                ));
            }
        };
        let info = parse_info_dict(&info_dict_value)?;

        let announce_list = if let Some(announce_list_value) = dict.remove(b"announce-list") {
            parse_announce_list(announce_list_value)?
        } else {
            Vec::new()
        };

        let creation_date = if let Some(date_value) = dict.remove(b"creation date") {
            match date_value {
                BencodeValue::Integer(timestamp) => {
                    let secs = timestamp
                        .try_into()
                        .map_err(|_| TorrentError::DateParseError)?;
                    let duration = std::time::Duration::from_secs(secs);
                    Some(UNIX_EPOCH + duration)
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Creation date not an integer".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let comment = match dict.remove(b"comment") {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(b"created by") {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(b"encoding") {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let pieces_hash = parse_pieces(&info.pieces)?;

        let torrent = TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        };
        torrent.validate_lengths()?;
        Ok(torrent)
    }

    /// Checks that the summed file lengths fill exactly `num_pieces` pieces,
    /// the last of which must be non-empty and at most one piece length.
    fn validate_lengths(&self) -> TorrentResult<()> {
        let total = self.total_length();
        let num_pieces = self.num_pieces() as i64;
        let piece_length = self.info.piece_length;

        let consistent = if num_pieces == 0 {
            total == 0
        } else {
            let last = total - (num_pieces - 1) * piece_length;
            last > 0 && last <= piece_length
        };

        if !consistent {
            return Err(TorrentError::LengthMismatch {
                total,
                num_pieces: self.num_pieces(),
                piece_length,
            });
        }
        Ok(())
    }

    /**
    Returns the total length of all files in the torrent.

    For single-file torrents this is the `length` field; for multi-file
    torrents it is the sum of each file's length in `files` order.
    */
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    /// Returns the total number of pieces in the torrent.
    /// Derived from the number of 20-byte hashes in `pieces_hash`.
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /**
    Returns the size of a specific piece in the torrent.

    All pieces except the last have size `piece_length`; the last piece
    covers whatever remains of the total length.
    */
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            self.total_length() - (self.num_pieces() - 1) as i64 * self.info.piece_length
        }
    }
}
