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

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{Result, Vdv453Error};
use crate::xml::element::XmlElement;

fn encoding_error<E: std::fmt::Display>(e: E) -> Vdv453Error {
    Vdv453Error::Protocol(format!("Error encoding XML: {e}"))
}

/// Encode `root` as a complete document, including the XML declaration
pub fn encode_document(root: &XmlElement) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(encoding_error)?;
    writer
        .write_event(Event::Text(BytesText::new("\n")))
        .map_err(encoding_error)?;
    write_element(&mut writer, root)?;
    Ok(writer.into_inner())
}

/// Encode `element` without XML declaration
pub fn encode_element(element: &XmlElement) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    write_element(&mut writer, element)?;
    Ok(writer.into_inner())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.text.is_empty() && element.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(encoding_error);
    }

    writer
        .write_event(Event::Start(start))
        .map_err(encoding_error)?;
    if !element.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&element.text)))
            .map_err(encoding_error)?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(encoding_error)
}
