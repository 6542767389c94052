/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use futures::stream::{self, BoxStream, StreamExt};
use log::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::AsyncBufRead;

use crate::abort::AbortToken;
use crate::error::{Result, Vdv453Error};
use crate::xml::element::XmlElement;

/// Lazy sequence of `(tag, element)` for every completed element of interest, in document order
pub type TagStream = BoxStream<'static, Result<(String, XmlElement)>>;

struct TagParser<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    tags: Vec<String>,
    // elements under construction, outermost first; only non-empty inside an element of interest
    stack: Vec<XmlElement>,
    token: AbortToken,
    finished: bool,
}

fn is_wanted(stack: &[XmlElement], tags: &[String], name: &str) -> bool {
    !stack.is_empty() || tags.iter().any(|t| t == name)
}

// Attach a completed element to its parent; returns it if it is a top-level element of interest
fn close(stack: &mut [XmlElement], element: XmlElement) -> Option<(String, XmlElement)> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            None
        }
        None => Some((element.name.clone(), element)),
    }
}

fn element_from_start(name: String, start: &BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new(name);
    for attribute in start.attributes() {
        let attribute = attribute
            .map_err(|e| Vdv453Error::Protocol(format!("Malformed attribute: {e}")))?;
        if attribute.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| Vdv453Error::Protocol(format!("Malformed attribute value: {e}")))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

impl<R: AsyncBufRead + Unpin> TagParser<R> {
    fn new(reader: R, tags: &[&str], token: AbortToken) -> Self {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().trim_text(true);
        TagParser {
            reader,
            buf: Vec::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            stack: Vec::new(),
            token,
            finished: false,
        }
    }

    async fn next_tag(&mut self) -> Result<Option<(String, XmlElement)>> {
        loop {
            self.buf.clear();
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                event = self.reader.read_event_into_async(&mut self.buf) => Some(event),
            };
            let event = match event {
                None => return Err(self.token.error()),
                Some(Err(e)) => {
                    return Err(Vdv453Error::Protocol(format!(
                        "Malformed XML at position {}: {e}",
                        self.reader.error_position()
                    )))
                }
                Some(Ok(event)) => event,
            };

            match event {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    if is_wanted(&self.stack, &self.tags, &name) {
                        let element = element_from_start(name, &start)?;
                        self.stack.push(element);
                    }
                }
                Event::Empty(start) => {
                    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    if is_wanted(&self.stack, &self.tags, &name) {
                        let element = element_from_start(name, &start)?;
                        if let Some(done) = close(&mut self.stack, element) {
                            return Ok(Some(done));
                        }
                    }
                }
                Event::End(_) => {
                    if let Some(element) = self.stack.pop() {
                        if let Some(done) = close(&mut self.stack, element) {
                            return Ok(Some(done));
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = self.stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|e| Vdv453Error::Protocol(format!("Malformed text: {e}")))?;
                        current.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = self.stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => {
                    if let Some(open) = self.stack.first() {
                        return Err(Vdv453Error::Protocol(format!(
                            "Unexpected end of document inside <{}>",
                            open.name
                        )));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

/// Incrementally parse `reader`, yielding each completed element whose local name is in `tags`,
/// together with its whole subtree. Elements of interest nested within another element of interest are
/// only delivered as part of the outer one.
///
/// The stream ends after the first error; it fails with `Vdv453Error::Canceled` once `token` is cancelled.
pub fn parse_tags<R>(reader: R, tags: &[&str], token: AbortToken) -> TagStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let parser = TagParser::new(reader, tags, token);
    stream::unfold(parser, |mut parser| async move {
        if parser.finished {
            return None;
        }
        match parser.next_tag().await {
            Ok(Some(item)) => {
                trace!("Parsed <{}>", item.0);
                Some((Ok(item), parser))
            }
            Ok(None) => None,
            Err(e) => {
                parser.finished = true;
                Some((Err(e), parser))
            }
        }
    })
    .boxed()
}

/// Parse `reader` until the first `root_tag` element is complete
pub async fn parse_whole_root<R>(reader: R, root_tag: &str, token: AbortToken) -> Result<XmlElement>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut tags = parse_tags(reader, &[root_tag], token);
    match tags.next().await {
        Some(Ok((_, element))) => Ok(element),
        Some(Err(e)) => Err(e),
        None => Err(Vdv453Error::Protocol(format!(
            "No <{root_tag}> root element"
        ))),
    }
}
