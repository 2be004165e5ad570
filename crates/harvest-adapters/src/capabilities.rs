//! GeoServer capability lookups: find the layer advertising a record's
//! metadata id and synthesize WMS/WFS resources for it.

use std::collections::HashMap;

use harvest_core::Resource;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fetch::fetch_text;
use crate::HarvestContext;

pub const CAPABILITIES_FIXTURE: &str = "geo_resource.xml";

const WMS_BBOX: &str =
    "16114148.554967716%2C-4456584.4971389165%2C16119040.524777967%2C-4451692.527328665";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityService {
    Wms,
    Wfs,
}

impl CapabilityService {
    pub const ALL: [CapabilityService; 2] = [CapabilityService::Wms, CapabilityService::Wfs];

    pub fn label(&self) -> &'static str {
        match self {
            CapabilityService::Wms => "WMS",
            CapabilityService::Wfs => "WFS",
        }
    }

    pub fn capabilities_url(&self, dns: &str) -> String {
        format!(
            "{dns}/geoserver/ows?service={}&request=getCapabilities",
            self.label()
        )
    }

    pub fn resource_url(&self, dns: &str, layer_name: &str) -> String {
        match self {
            CapabilityService::Wms => format!(
                "{dns}/geoserver/wms?service=wms&request=getmap&format=image%2Fpng8&transparent=true&layers={layer_name}&width=512&height=512&crs=epsg%3A3857&bbox={WMS_BBOX}"
            ),
            CapabilityService::Wfs => {
                format!("{dns}/geoserver/wfs?request=GetCapabilities&service=WFS")
            }
        }
    }
}

/// Layer that carries a `MetadataID=<uuid>` keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMatch {
    pub title: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
enum Tracked {
    Title,
    Name,
    Keyword,
}

/// Scan a capabilities document for the keyword `MetadataID=<uuid>` and pair
/// it with the nearest preceding `Title` and `Name` elements.
pub fn find_layer_for_metadata(xml: &str, metadata_uuid: &str) -> Option<LayerMatch> {
    let wanted = format!("MetadataID={metadata_uuid}");
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut inside: Option<Tracked> = None;
    let mut text = String::new();
    let mut last_title: Option<String> = None;
    let mut last_name: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                inside = match e.local_name().as_ref() {
                    b"Title" => Some(Tracked::Title),
                    b"Name" => Some(Tracked::Name),
                    b"Keyword" => Some(Tracked::Keyword),
                    _ => None,
                };
                text.clear();
            }
            Ok(Event::Text(t)) if inside.is_some() => match t.unescape() {
                Ok(chunk) => text.push_str(&chunk),
                Err(err) => debug!(error = %err, "skipping undecodable text"),
            },
            Ok(Event::End(_)) => match inside.take() {
                Some(Tracked::Title) => last_title = Some(text.trim().to_string()),
                Some(Tracked::Name) => last_name = Some(text.trim().to_string()),
                Some(Tracked::Keyword) if text.trim() == wanted => {
                    return Some(LayerMatch {
                        title: last_title?,
                        name: last_name?,
                    });
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                warn!(error = %err, "capabilities document is not well-formed");
                return None;
            }
            _ => {}
        }
        buf.clear();
    }
    None
}

/// Capabilities documents fetched during one run, keyed by service.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    documents: Mutex<HashMap<CapabilityService, Option<String>>>,
}

impl CapabilityCache {
    async fn document(
        &self,
        ctx: &HarvestContext<'_>,
        dns: &str,
        service: CapabilityService,
    ) -> Option<String> {
        let mut documents = self.documents.lock().await;
        if let Some(cached) = documents.get(&service) {
            return cached.clone();
        }
        let url = service.capabilities_url(dns);
        let fetched = fetch_text(ctx, &url, &[], CAPABILITIES_FIXTURE).await;
        documents.insert(service, fetched.clone());
        fetched
    }
}

/// One resource per capability service whose document lists a layer for
/// `metadata_uuid`. Services without a match contribute nothing.
pub async fn capability_resources(
    ctx: &HarvestContext<'_>,
    metadata_uuid: &str,
    period_start: Option<String>,
    period_end: Option<String>,
) -> Vec<Resource> {
    let Some(dns) = ctx.config.geoserver_dns.as_deref() else {
        return Vec::new();
    };
    let dns = dns.trim_end_matches('/');

    let mut resources = Vec::new();
    for service in CapabilityService::ALL {
        let Some(document) = ctx.capabilities.document(ctx, dns, service).await else {
            continue;
        };
        let Some(layer) = find_layer_for_metadata(&document, metadata_uuid) else {
            debug!(service = service.label(), metadata_uuid, "no layer for record");
            continue;
        };
        resources.push(Resource {
            name: Some(format!("{} {}", layer.title.to_uppercase(), service.label())),
            format: Some(service.label().to_string()),
            url: service.resource_url(dns, &layer.name),
            period_start: period_start.clone(),
            period_end: period_end.clone(),
            ..Default::default()
        });
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use harvest_core::{HarvestConfig, SourceKind};

    const WMS_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities version="1.3.0">
  <Capability>
    <Layer>
      <Title>GeoServer Web Map Service</Title>
      <Layer queryable="1">
        <Name>open-data-platform:fire_history</Name>
        <Title>Fire History</Title>
        <KeywordList>
          <Keyword>features</Keyword>
          <Keyword>MetadataID=aaaa-1111</Keyword>
        </KeywordList>
      </Layer>
      <Layer queryable="1">
        <Name>open-data-platform:roads &amp; tracks</Name>
        <Title>Roads &amp; Tracks</Title>
        <KeywordList><Keyword>MetadataID=bbbb-2222</Keyword></KeywordList>
      </Layer>
    </Layer>
  </Capability>
</WMS_Capabilities>"#;

    #[test]
    fn keyword_pairs_with_preceding_title_and_name() {
        assert_eq!(
            find_layer_for_metadata(WMS_DOC, "aaaa-1111"),
            Some(LayerMatch {
                title: "Fire History".into(),
                name: "open-data-platform:fire_history".into(),
            })
        );
        let second = find_layer_for_metadata(WMS_DOC, "bbbb-2222").expect("layer");
        assert_eq!(second.title, "Roads & Tracks");
        assert_eq!(find_layer_for_metadata(WMS_DOC, "cccc-3333"), None);
    }

    #[test]
    fn namespaced_wfs_keywords_match_by_local_name() {
        let doc = r#"<wfs:WFS_Capabilities xmlns:wfs="http://www.opengis.net/wfs/2.0" xmlns:ows="http://www.opengis.net/ows/1.1">
  <FeatureTypeList><FeatureType>
    <Name>odp:fire_history</Name><Title>Fire History</Title>
    <ows:Keywords><ows:Keyword>MetadataID=aaaa-1111</ows:Keyword></ows:Keywords>
  </FeatureType></FeatureTypeList>
</wfs:WFS_Capabilities>"#;
        let layer = find_layer_for_metadata(doc, "aaaa-1111").expect("layer");
        assert_eq!(layer.name, "odp:fire_history");
    }

    #[test]
    fn service_urls() {
        assert_eq!(
            CapabilityService::Wfs.capabilities_url("https://geo.test"),
            "https://geo.test/geoserver/ows?service=WFS&request=getCapabilities"
        );
        assert!(CapabilityService::Wms
            .resource_url("https://geo.test", "odp:layer")
            .contains("layers=odp:layer&width=512"));
    }

    #[tokio::test]
    async fn fixture_capabilities_yield_one_resource_per_service() {
        let config = HarvestConfig {
            geoserver_dns: Some("https://geo.test".into()),
            ..Default::default()
        };
        let harness = Harness::new(SourceKind::Delwp, "{}").with_config(config);
        let ctx = harness.ctx();
        let resources = capability_resources(
            &ctx,
            "0a1b2c3d-0000-4000-8000-000000000001",
            Some("2020-01-01T00:00:00".into()),
            None,
        )
        .await;
        let names: Vec<_> = resources.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(names, vec!["FIRE HISTORY WMS", "FIRE HISTORY WFS"]);
        assert!(resources[1].url.ends_with("request=GetCapabilities&service=WFS"));
        assert!(capability_resources(&ctx, "unknown", None, None).await.is_empty());
    }
}
