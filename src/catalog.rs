//! Static catalog of municipal areas and procedures, plus the mock
//! radicado tracking table.

use std::fmt;

pub const NOT_FOUND_MESSAGE: &str =
    "No se encontró ningún trámite con ese número de radicado. Verifica el código e intenta de nuevo.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub id: &'static str,
    pub nombre: &'static str,
    pub descripcion: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tramite {
    pub id: &'static str,
    pub area_id: &'static str,
    pub nombre: &'static str,
    pub descripcion: &'static str,
    pub requisitos: &'static [&'static str],
    pub tiempo_estimado: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TramiteStatus {
    Recibido,
    EnRevision,
    PendienteDocumentos,
    Aprobado,
    Rechazado,
}

impl fmt::Display for TramiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TramiteStatus::Recibido => "Recibido",
            TramiteStatus::EnRevision => "En Revisión",
            TramiteStatus::PendienteDocumentos => "Pendiente Documentos",
            TramiteStatus::Aprobado => "Aprobado",
            TramiteStatus::Rechazado => "Rechazado",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEvent {
    pub fecha: &'static str,
    pub evento: &'static str,
    pub detalle: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seguimiento {
    pub id_radicado: &'static str,
    pub tramite_nombre: &'static str,
    pub area_nombre: &'static str,
    pub estado: TramiteStatus,
    pub fecha_radicacion: &'static str,
    pub ultima_actualizacion: &'static str,
    pub historial: &'static [HistoryEvent],
}

pub const AREAS: &[Area] = &[
    Area {
        id: "planeacion",
        nombre: "Secretaría de Planeación",
        descripcion: "Gestión del territorio y licencias de construcción.",
    },
    Area {
        id: "gobierno",
        nombre: "Secretaría de Gobierno",
        descripcion: "Convivencia ciudadana y trámites administrativos.",
    },
    Area {
        id: "hacienda",
        nombre: "Secretaría de Hacienda",
        descripcion: "Impuesto predial, industria y comercio.",
    },
    Area {
        id: "salud",
        nombre: "Secretaría de Salud",
        descripcion: "Afiliación al SISBÉN y vigilancia sanitaria.",
    },
    Area {
        id: "transito",
        nombre: "Secretaría de Tránsito",
        descripcion: "Multas, licencias y movilidad urbana.",
    },
    Area {
        id: "policia",
        nombre: "Inspección de Policía",
        descripcion: "Querellas y procesos de convivencia.",
    },
];

pub const TRAMITES: &[Tramite] = &[
    Tramite {
        id: "t1",
        area_id: "planeacion",
        nombre: "Licencia de Construcción",
        descripcion: "Autorización previa para desarrollar edificaciones.",
        requisitos: &["Cédula", "Certificado Tradición", "Planos Arquitectónicos", "Pago expensas"],
        tiempo_estimado: "45 días hábiles",
    },
    Tramite {
        id: "t2",
        area_id: "hacienda",
        nombre: "Pago Impuesto Predial",
        descripcion: "Liquidación y pago de impuesto sobre inmuebles.",
        requisitos: &["Número de matricula inmobiliaria", "Cédula del propietario"],
        tiempo_estimado: "Inmediato",
    },
    Tramite {
        id: "t3",
        area_id: "salud",
        nombre: "Certificado de Discapacidad",
        descripcion: "Documento que certifica la condición de discapacidad.",
        requisitos: &["Historia clínica reciente", "Documento de identidad"],
        tiempo_estimado: "15 días hábiles",
    },
];

const SEGUIMIENTOS: &[Seguimiento] = &[Seguimiento {
    id_radicado: "RAD-2024-001",
    tramite_nombre: "Licencia de Construcción",
    area_nombre: "Secretaría de Planeación",
    estado: TramiteStatus::EnRevision,
    fecha_radicacion: "2024-01-15",
    ultima_actualizacion: "2024-01-20",
    historial: &[
        HistoryEvent {
            fecha: "2024-01-15",
            evento: "Radicación",
            detalle: "Documentos recibidos por ventanilla única.",
        },
        HistoryEvent {
            fecha: "2024-01-18",
            evento: "Asignación Técnica",
            detalle: "Expediente asignado al arquitecto revisor.",
        },
        HistoryEvent {
            fecha: "2024-01-20",
            evento: "Revisión Preliminar",
            detalle: "Se verifica cumplimiento de normas urbanísticas.",
        },
    ],
}];

pub fn area(id: &str) -> Option<&'static Area> {
    AREAS.iter().find(|area| area.id == id)
}

/// Procedures of one area, or all of them.
pub fn tramites(area_id: Option<&str>) -> Vec<&'static Tramite> {
    TRAMITES
        .iter()
        .filter(|t| area_id.is_none_or(|id| t.area_id == id))
        .collect()
}

/// Exact match on the trimmed radicado; input is upper-cased first.
pub fn lookup(radicado: &str) -> Option<&'static Seguimiento> {
    let key = radicado.trim().to_uppercase();
    SEGUIMIENTOS.iter().find(|s| s.id_radicado == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_radicado_resolves_with_history() {
        let found = lookup("  RAD-2024-001 ").unwrap();
        assert_eq!(found.estado, TramiteStatus::EnRevision);
        assert_eq!(found.estado.to_string(), "En Revisión");
        assert_eq!(found.historial.len(), 3);
        assert_eq!(found.historial[0].evento, "Radicación");
    }

    #[test]
    fn lowercase_radicado_resolves() {
        let found = lookup(" rad-2024-001").unwrap();
        assert_eq!(found.id_radicado, "RAD-2024-001");
        assert!(lookup("Rad-2024-001").is_some());
    }

    #[test]
    fn unknown_radicado_misses() {
        assert!(lookup("RAD-2024-999").is_none());
        assert!(lookup("RAD-2024-0011").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn tramites_filter_by_area() {
        assert_eq!(tramites(None).len(), 3);
        let salud = tramites(Some("salud"));
        assert_eq!(salud.len(), 1);
        assert_eq!(salud[0].nombre, "Certificado de Discapacidad");
        assert!(tramites(Some("policia")).is_empty());
    }

    #[test]
    fn every_tramite_belongs_to_a_known_area() {
        for tramite in TRAMITES {
            assert!(area(tramite.area_id).is_some(), "{} has no area", tramite.id);
        }
        assert_eq!(AREAS.len(), 6);
    }
}
