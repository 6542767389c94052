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

//! Typed views of the VDV 454 data most consumers care about: real-time trips (`IstFahrt`) from the `aus` service and
//! scheduled trips (`SollFahrt`) from the `ausref` service.

use serde::Serialize;

use crate::fetch_engine::DataEvent;
use crate::helpers::parse_vdv_bool;
use crate::services::Service;
use crate::xml::element::XmlElement;

fn text(element: &XmlElement, name: &str) -> Option<String> {
    element.child_text(name).map(String::from)
}

fn flag(element: &XmlElement, name: &str) -> Option<bool> {
    element.child_text(name).and_then(parse_vdv_bool)
}

fn service_attributes(element: &XmlElement) -> Vec<(String, String)> {
    element
        .children_named("ServiceAttribut")
        .flat_map(|attribute| attribute.children.iter())
        .map(|c| (c.name.clone(), c.text.trim().to_string()))
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FahrtId {
    pub fahrt_bezeichner: Option<String>,
    pub betriebstag: Option<String>,
}

impl FahrtId {
    fn from_element(element: &XmlElement) -> Option<Self> {
        element.child("FahrtID").map(|fahrt_id| FahrtId {
            fahrt_bezeichner: text(fahrt_id, "FahrtBezeichner"),
            betriebstag: text(fahrt_id, "Betriebstag"),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FahrtStartEnde {
    #[serde(rename = "StartHaltID")]
    pub start_halt_id: Option<String>,
    pub startzeit: Option<String>,
    #[serde(rename = "EndHaltID")]
    pub end_halt_id: Option<String>,
    pub endzeit: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IstHalt {
    #[serde(rename = "HaltID")]
    pub halt_id: Option<String>,
    pub abfahrtszeit: Option<String>,
    pub ist_abfahrt_prognose: Option<String>,
    pub abfahrtssteig_text: Option<String>,
    pub einsteigeverbot: Option<bool>,
    pub ankunftszeit: Option<String>,
    pub ist_ankunft_prognose: Option<String>,
    pub ankunftssteig_text: Option<String>,
    pub aussteigeverbot: Option<bool>,
    pub durchfahrt: Option<bool>,
    pub zusatzhalt: Option<bool>,
    pub hinweis_text: Option<String>,
}

/// Real-time state of one trip, from an `AUSNachricht`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IstFahrt {
    pub zst: Option<String>,
    #[serde(rename = "LinienID")]
    pub linien_id: Option<String>,
    pub linien_text: Option<String>,
    #[serde(rename = "RichtungsID")]
    pub richtungs_id: Option<String>,
    pub richtungs_text: Option<String>,
    #[serde(rename = "FahrtID")]
    pub fahrt_id: Option<FahrtId>,
    pub fahrt_start_ende: Option<FahrtStartEnde>,
    pub komplettfahrt: Option<bool>,
    #[serde(rename = "UmlaufID")]
    pub umlauf_id: Option<String>,
    pub prognose_moeglich: Option<bool>,
    pub faellt_aus: Option<bool>,
    #[serde(rename = "FahrzeugTypID")]
    pub fahrzeug_typ_id: Option<String>,
    pub service_attributs: Vec<(String, String)>,
    pub ist_halts: Vec<IstHalt>,
    /// `Zst` of the `Bestaetigung` this trip was delivered with
    pub bestaetigung_zst: Option<String>,
}

impl IstFahrt {
    pub fn from_element(ist_fahrt: &XmlElement, bestaetigung_zst: Option<&str>) -> Self {
        let fahrt_ref = ist_fahrt.child("FahrtRef");
        IstFahrt {
            zst: ist_fahrt.attribute("Zst").map(String::from),
            linien_id: text(ist_fahrt, "LinienID"),
            linien_text: text(ist_fahrt, "LinienText"),
            richtungs_id: text(ist_fahrt, "RichtungsID"),
            richtungs_text: text(ist_fahrt, "RichtungsText"),
            fahrt_id: fahrt_ref.and_then(FahrtId::from_element),
            fahrt_start_ende: fahrt_ref
                .and_then(|r| r.child("FahrtStartEnde"))
                .map(|start_ende| FahrtStartEnde {
                    start_halt_id: text(start_ende, "StartHaltID"),
                    startzeit: text(start_ende, "Startzeit"),
                    end_halt_id: text(start_ende, "EndHaltID"),
                    endzeit: text(start_ende, "Endzeit"),
                }),
            komplettfahrt: flag(ist_fahrt, "Komplettfahrt"),
            umlauf_id: text(ist_fahrt, "UmlaufID"),
            prognose_moeglich: flag(ist_fahrt, "PrognoseMoeglich"),
            faellt_aus: flag(ist_fahrt, "FaelltAus"),
            fahrzeug_typ_id: text(ist_fahrt, "FahrzeugTypID"),
            service_attributs: service_attributes(ist_fahrt),
            ist_halts: ist_fahrt
                .children_named("IstHalt")
                .map(|halt| IstHalt {
                    halt_id: text(halt, "HaltID"),
                    abfahrtszeit: text(halt, "Abfahrtszeit"),
                    ist_abfahrt_prognose: text(halt, "IstAbfahrtPrognose"),
                    abfahrtssteig_text: text(halt, "AbfahrtssteigText"),
                    einsteigeverbot: flag(halt, "Einsteigeverbot"),
                    ankunftszeit: text(halt, "Ankunftszeit"),
                    ist_ankunft_prognose: text(halt, "IstAnkunftPrognose"),
                    ankunftssteig_text: text(halt, "AnkunftssteigText"),
                    aussteigeverbot: flag(halt, "Aussteigeverbot"),
                    durchfahrt: flag(halt, "Durchfahrt"),
                    zusatzhalt: flag(halt, "Zusatzhalt"),
                    hinweis_text: text(halt, "HinweisText"),
                })
                .collect(),
            bestaetigung_zst: bestaetigung_zst.map(String::from),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SollHalt {
    #[serde(rename = "HaltID")]
    pub halt_id: Option<String>,
    pub haltestellen_name: Option<String>,
    pub abfahrtszeit: Option<String>,
    pub abfahrtssteig_text: Option<String>,
    pub einsteigeverbot: Option<bool>,
    pub ankunftszeit: Option<String>,
    pub ankunftssteig_text: Option<String>,
    pub aussteigeverbot: Option<bool>,
    pub durchfahrt: Option<bool>,
    pub richtungs_text: Option<String>,
    pub von_text: Option<String>,
}

/// Scheduled trip, from a `Linienfahrplan` of an `ausref` `AUSNachricht`.
///
/// Line-level fields a `SollFahrt` does not override are taken from its `Linienfahrplan`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SollFahrt {
    pub zst: Option<String>,
    #[serde(rename = "LinienID")]
    pub linien_id: Option<String>,
    #[serde(rename = "RichtungsID")]
    pub richtungs_id: Option<String>,
    #[serde(rename = "ProduktID")]
    pub produkt_id: Option<String>,
    #[serde(rename = "BetreiberID")]
    pub betreiber_id: Option<String>,
    pub linien_text: Option<String>,
    pub richtungs_text: Option<String>,
    pub von_richtungs_text: Option<String>,
    pub verkehrsmittel_text: Option<String>,
    pub prognose_moeglich: Option<bool>,
    pub fahrradmitnahme: Option<bool>,
    #[serde(rename = "FahrtID")]
    pub fahrt_id: Option<FahrtId>,
    #[serde(rename = "UmlaufID")]
    pub umlauf_id: Option<String>,
    #[serde(rename = "LinienfahrwegID")]
    pub linienfahrweg_id: Option<String>,
    pub zugname: Option<String>,
    pub zusatzfahrt: Option<bool>,
    pub faellt_aus: Option<bool>,
    #[serde(rename = "FahrzeugTypID")]
    pub fahrzeug_typ_id: Option<String>,
    pub service_attributs: Vec<(String, String)>,
    pub soll_halts: Vec<SollHalt>,
    pub bestaetigung_zst: Option<String>,
}

impl SollFahrt {
    pub fn from_element(
        soll_fahrt: &XmlElement,
        linienfahrplan: &XmlElement,
        bestaetigung_zst: Option<&str>,
    ) -> Self {
        let inherited = |name: &str| text(soll_fahrt, name).or_else(|| text(linienfahrplan, name));
        let inherited_flag =
            |name: &str| flag(soll_fahrt, name).or_else(|| flag(linienfahrplan, name));

        SollFahrt {
            zst: soll_fahrt.attribute("Zst").map(String::from),
            linien_id: text(linienfahrplan, "LinienID"),
            richtungs_id: text(linienfahrplan, "RichtungsID"),
            produkt_id: text(linienfahrplan, "ProduktID"),
            betreiber_id: text(linienfahrplan, "BetreiberID"),
            linien_text: inherited("LinienText"),
            richtungs_text: inherited("RichtungsText"),
            von_richtungs_text: inherited("VonRichtungsText"),
            verkehrsmittel_text: inherited("VerkehrsmittelText"),
            prognose_moeglich: inherited_flag("PrognoseMoeglich"),
            fahrradmitnahme: inherited_flag("Fahrradmitnahme"),
            fahrt_id: FahrtId::from_element(soll_fahrt),
            umlauf_id: text(soll_fahrt, "UmlaufID"),
            linienfahrweg_id: text(soll_fahrt, "LinienfahrwegID"),
            zugname: text(soll_fahrt, "Zugname"),
            zusatzfahrt: flag(soll_fahrt, "Zusatzfahrt"),
            faellt_aus: flag(soll_fahrt, "FaelltAus"),
            fahrzeug_typ_id: text(soll_fahrt, "FahrzeugTypID"),
            service_attributs: service_attributes(soll_fahrt),
            soll_halts: soll_fahrt
                .children_named("SollHalt")
                .map(|halt| SollHalt {
                    halt_id: text(halt, "HaltID"),
                    haltestellen_name: text(halt, "HaltestellenName"),
                    abfahrtszeit: text(halt, "Abfahrtszeit"),
                    abfahrtssteig_text: text(halt, "AbfahrtssteigText"),
                    einsteigeverbot: flag(halt, "Einsteigeverbot"),
                    ankunftszeit: text(halt, "Ankunftszeit"),
                    ankunftssteig_text: text(halt, "AnkunftssteigText"),
                    aussteigeverbot: flag(halt, "Aussteigeverbot"),
                    durchfahrt: flag(halt, "Durchfahrt"),
                    richtungs_text: text(halt, "RichtungsText"),
                    von_text: text(halt, "VonText"),
                })
                .collect(),
            bestaetigung_zst: bestaetigung_zst.map(String::from),
        }
    }
}

/// All `IstFahrt`s of an `aus` data event; empty for events of other services
pub fn ist_fahrten(event: &DataEvent) -> Vec<IstFahrt> {
    if event.service != Service::Aus {
        return Vec::new();
    }
    event
        .element
        .children_named("IstFahrt")
        .map(|ist_fahrt| IstFahrt::from_element(ist_fahrt, event.confirmation_zst.as_deref()))
        .collect()
}

/// All `SollFahrt`s of an `ausref` data event; empty for events of other services
pub fn soll_fahrten(event: &DataEvent) -> Vec<SollFahrt> {
    if event.service != Service::RefAus {
        return Vec::new();
    }
    event
        .element
        .children_named("Linienfahrplan")
        .flat_map(|linienfahrplan| {
            linienfahrplan.children_named("SollFahrt").map(move |soll_fahrt| {
                SollFahrt::from_element(
                    soll_fahrt,
                    linienfahrplan,
                    event.confirmation_zst.as_deref(),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortToken;
    use crate::xml::parser::parse_whole_root;

    async fn parse(xml: &'static str) -> XmlElement {
        parse_whole_root(xml.as_bytes(), "AUSNachricht", AbortToken::new())
            .await
            .unwrap()
    }

    fn event(service: Service, element: XmlElement) -> DataEvent {
        DataEvent {
            service,
            tag: String::from("AUSNachricht"),
            element,
            confirmation_zst: Some(String::from("2024-04-11T10:00:00Z")),
        }
    }

    #[tokio::test]
    async fn test_ist_fahrten() {
        let element = parse(
            r#"<AUSNachricht AboID="1">
                <IstFahrt Zst="2024-04-11T09:59:58Z">
                    <LinienID>M4</LinienID>
                    <RichtungsID>1</RichtungsID>
                    <FahrtRef>
                        <FahrtID>
                            <FahrtBezeichner>9325_877</FahrtBezeichner>
                            <Betriebstag>2024-04-11</Betriebstag>
                        </FahrtID>
                    </FahrtRef>
                    <Komplettfahrt>false</Komplettfahrt>
                    <ServiceAttribut><Niederflur>true</Niederflur></ServiceAttribut>
                    <IstHalt>
                        <HaltID>900100001</HaltID>
                        <Abfahrtszeit>2024-04-11T10:03:00Z</Abfahrtszeit>
                        <IstAbfahrtPrognose>2024-04-11T10:05:00Z</IstAbfahrtPrognose>
                        <Einsteigeverbot>0</Einsteigeverbot>
                    </IstHalt>
                    <IstHalt><HaltID>900100002</HaltID><Durchfahrt>true</Durchfahrt></IstHalt>
                </IstFahrt>
            </AUSNachricht>"#,
        )
        .await;

        let fahrten = ist_fahrten(&event(Service::Aus, element.clone()));
        assert_eq!(fahrten.len(), 1);
        let fahrt = &fahrten[0];
        assert_eq!(fahrt.zst.as_deref(), Some("2024-04-11T09:59:58Z"));
        assert_eq!(fahrt.linien_id.as_deref(), Some("M4"));
        assert_eq!(fahrt.linien_text, None);
        assert_eq!(
            fahrt.fahrt_id,
            Some(FahrtId {
                fahrt_bezeichner: Some(String::from("9325_877")),
                betriebstag: Some(String::from("2024-04-11")),
            })
        );
        assert_eq!(fahrt.fahrt_start_ende, None);
        assert_eq!(fahrt.komplettfahrt, Some(false));
        assert_eq!(
            fahrt.service_attributs,
            vec![(String::from("Niederflur"), String::from("true"))]
        );
        assert_eq!(fahrt.ist_halts.len(), 2);
        assert_eq!(
            fahrt.ist_halts[0].ist_abfahrt_prognose.as_deref(),
            Some("2024-04-11T10:05:00Z")
        );
        assert_eq!(fahrt.ist_halts[0].einsteigeverbot, Some(false));
        assert_eq!(fahrt.ist_halts[1].durchfahrt, Some(true));
        assert_eq!(
            fahrt.bestaetigung_zst.as_deref(),
            Some("2024-04-11T10:00:00Z")
        );

        let json = serde_json::to_value(fahrt).unwrap();
        assert_eq!(json["LinienID"], "M4");
        assert_eq!(json["FahrtID"]["FahrtBezeichner"], "9325_877");
        assert_eq!(json["IstHalts"][0]["HaltID"], "900100001");

        assert!(ist_fahrten(&event(Service::Dfi, element)).is_empty());
    }

    #[tokio::test]
    async fn test_soll_fahrten_inherit_from_linienfahrplan() {
        let element = parse(
            r#"<AUSNachricht AboID="2">
                <Linienfahrplan>
                    <LinienID>U2</LinienID>
                    <RichtungsID>2</RichtungsID>
                    <ProduktID>U-Bahn</ProduktID>
                    <BetreiberID>BVG</BetreiberID>
                    <LinienText>U2</LinienText>
                    <RichtungsText>Pankow</RichtungsText>
                    <SollFahrt Zst="2024-04-10T22:00:00Z">
                        <FahrtID>
                            <FahrtBezeichner>1</FahrtBezeichner>
                            <Betriebstag>2024-04-11</Betriebstag>
                        </FahrtID>
                        <SollHalt><HaltID>A</HaltID><Abfahrtszeit>2024-04-11T06:00:00Z</Abfahrtszeit></SollHalt>
                        <SollHalt><HaltID>B</HaltID><Ankunftszeit>2024-04-11T06:02:00Z</Ankunftszeit></SollHalt>
                    </SollFahrt>
                    <SollFahrt>
                        <RichtungsText>Alexanderplatz</RichtungsText>
                        <Zusatzfahrt>true</Zusatzfahrt>
                    </SollFahrt>
                </Linienfahrplan>
            </AUSNachricht>"#,
        )
        .await;

        let fahrten = soll_fahrten(&event(Service::RefAus, element));
        assert_eq!(fahrten.len(), 2);

        assert_eq!(fahrten[0].linien_id.as_deref(), Some("U2"));
        assert_eq!(fahrten[0].betreiber_id.as_deref(), Some("BVG"));
        assert_eq!(fahrten[0].richtungs_text.as_deref(), Some("Pankow"));
        assert_eq!(fahrten[0].soll_halts.len(), 2);
        assert_eq!(fahrten[0].soll_halts[1].halt_id.as_deref(), Some("B"));
        assert_eq!(fahrten[0].zusatzfahrt, None);

        assert_eq!(
            fahrten[1].richtungs_text.as_deref(),
            Some("Alexanderplatz")
        );
        assert_eq!(fahrten[1].linien_text.as_deref(), Some("U2"));
        assert_eq!(fahrten[1].zusatzfahrt, Some(true));
        assert_eq!(fahrten[1].fahrt_id, None);
    }
}
